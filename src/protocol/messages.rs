//! Wire records exchanged with the orchestrator
//!
//! Every payload on the bus is one of the records below, serialized as JSON
//! with camelCase field names and RFC 3339 timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Runtime lifecycle state as reported on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Initializing,
    Registering,
    Ready,
    /// Derived label: `Ready` with at least one active task
    Processing,
    Error,
    Stopping,
    Stopped,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeState::Initializing => "initializing",
            RuntimeState::Registering => "registering",
            RuntimeState::Ready => "ready",
            RuntimeState::Processing => "processing",
            RuntimeState::Error => "error",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Stopped => "stopped",
        }
    }

    /// States that only exist while a lifecycle transition is in progress
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            RuntimeState::Initializing | RuntimeState::Registering | RuntimeState::Stopping
        )
    }

    /// Whether the runtime is serving tasks
    pub fn is_running(&self) -> bool {
        matches!(self, RuntimeState::Ready | RuntimeState::Processing)
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published on `agent.registration` when the runtime starts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub status: RuntimeState,
    pub registration_time: DateTime<Utc>,
    pub version: String,
}

/// Published on `agent.unregistration` during shutdown
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Unregistration {
    pub agent_id: String,
    pub status: RuntimeState,
    pub timestamp: DateTime<Utc>,
}

/// Process and task metrics carried by heartbeats and status replies
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMetrics {
    pub memory_usage_mb: f64,
    pub cpu_usage_percent: f64,
    pub active_task_count: usize,
    pub uptime_seconds: u64,
}

/// Heartbeat published on `agent.health`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub agent_id: String,
    pub status: RuntimeState,
    pub timestamp: DateTime<Utc>,
    pub metrics: ProcessMetrics,
    pub active_tasks: usize,
}

/// Inbound task assignment from `agent.<id>.task`
///
/// Every field is optional at the decode boundary so that validation can
/// answer a malformed task with an explicit failure instead of a decode error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Wrongly typed field found by the lenient decoder; intake answers it
    /// with a `ValidationError`
    #[serde(skip)]
    pub malformed: Option<String>,
}

/// Error carried by failed and cancelled results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskError {
    pub message: String,
    /// Stable error-kind label such as `ValidationError`
    #[serde(rename = "type")]
    pub kind: String,
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.into(),
        }
    }
}

/// Stable error-kind labels produced by the runtime itself
pub mod error_kind {
    pub const VALIDATION: &str = "ValidationError";
    pub const UNSUPPORTED_TASK: &str = "UnsupportedTaskError";
    pub const CANCELLED: &str = "TaskCancelled";
    pub const OVERLOADED: &str = "Overloaded";
    pub const PANIC: &str = "Panic";
}

/// Terminal status of a task together with the payload that status carries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskOutcomeStatus {
    Completed {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        result: Value,
    },
    Failed {
        error: TaskError,
    },
    Cancelled {
        error: TaskError,
    },
}

/// Published once per task on `task.<taskId>.result`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    #[serde(flatten)]
    pub outcome: TaskOutcomeStatus,
    #[serde(rename = "processingTime")]
    pub processing_time_ms: u64,
}

impl TaskResult {
    /// A completed result. `result` is always an object on the wire, so any
    /// other non-null value is wrapped as `{"value": ...}`.
    pub fn completed(task_id: impl Into<String>, result: Value, processing_time_ms: u64) -> Self {
        let result = match result {
            Value::Object(_) | Value::Null => result,
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("value".to_string(), other);
                Value::Object(wrapped)
            }
        };
        Self {
            task_id: task_id.into(),
            outcome: TaskOutcomeStatus::Completed { result },
            processing_time_ms,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: TaskError, processing_time_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            outcome: TaskOutcomeStatus::Failed { error },
            processing_time_ms,
        }
    }

    pub fn cancelled(task_id: impl Into<String>, processing_time_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            outcome: TaskOutcomeStatus::Cancelled {
                error: TaskError::new(
                    error_kind::CANCELLED,
                    "Task cancelled due to agent shutdown",
                ),
            },
            processing_time_ms,
        }
    }

    pub fn status_label(&self) -> &'static str {
        match self.outcome {
            TaskOutcomeStatus::Completed { .. } => "completed",
            TaskOutcomeStatus::Failed { .. } => "failed",
            TaskOutcomeStatus::Cancelled { .. } => "cancelled",
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match &self.outcome {
            TaskOutcomeStatus::Completed { .. } => None,
            TaskOutcomeStatus::Failed { error } | TaskOutcomeStatus::Cancelled { error } => {
                Some(error)
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, TaskOutcomeStatus::Completed { .. })
    }
}

/// Inbound message on `agent.<id>.control`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Control commands understood by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Stop,
    Status,
    Restart,
    ClearTasks,
    Unknown(String),
}

impl ControlCommand {
    pub fn parse(command: &str) -> Self {
        match command {
            "stop" => ControlCommand::Stop,
            "status" => ControlCommand::Status,
            "restart" => ControlCommand::Restart,
            "clearTasks" => ControlCommand::ClearTasks,
            other => ControlCommand::Unknown(other.to_string()),
        }
    }
}

impl ControlMessage {
    pub fn command(&self) -> ControlCommand {
        ControlCommand::parse(&self.command)
    }
}

/// Reply to a `status` control command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReply {
    pub agent_id: String,
    pub status: RuntimeState,
    pub timestamp: DateTime<Utc>,
    /// Identifiers of the tasks currently in flight
    pub active_tasks: Vec<String>,
    pub active_task_count: usize,
    pub metrics: ProcessMetrics,
}

//! HTTP facade for operators and local callers
//!
//! Tasks posted here take the same intake path as tasks from the bus, and
//! their results are still published on `task.<taskId>.result`.

use crate::agent::{AgentRuntime, Intake, TaskExecutor};
use crate::protocol::{error_kind, RuntimeState, TaskMessage, TaskOutcomeStatus};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::{Filter, Rejection, Reply};

const MAX_BODY_BYTES: u64 = 256 * 1024;

type JsonReply = WithStatus<Json>;

/// Task submission body. `taskId` is generated when absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSubmission {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    agent_id: String,
    state: RuntimeState,
    broker_connected: bool,
    active_tasks: usize,
    uptime_seconds: u64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CapabilitiesResponse<'a> {
    agent_id: &'a str,
    agent_type: &'a str,
    version: &'a str,
    capabilities: Vec<&'a str>,
}

pub struct ApiServer<T: Transport, E: TaskExecutor> {
    runtime: Arc<AgentRuntime<T, E>>,
    metrics_enabled: bool,
    shutdown_tx: watch::Sender<bool>,
}

impl<T: Transport, E: TaskExecutor> ApiServer<T, E> {
    pub fn new(runtime: Arc<AgentRuntime<T, E>>, metrics_enabled: bool) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            runtime,
            metrics_enabled,
            shutdown_tx,
        }
    }

    /// Flips to `true` once `POST /shutdown` is received
    pub fn shutdown_requested(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let runtime = self.runtime.clone();
        let with_runtime = warp::any().map(move || runtime.clone());

        let health = warp::path!("health")
            .and(warp::get())
            .and(with_runtime.clone())
            .and_then(health_handler::<T, E>);

        let submit = warp::path!("task")
            .and(warp::post())
            .and(warp::body::content_length_limit(MAX_BODY_BYTES))
            .and(warp::body::json())
            .and(with_runtime.clone())
            .and_then(submit_handler::<T, E>);

        let lookup = warp::path!("task" / String)
            .and(warp::get())
            .and(with_runtime.clone())
            .and_then(task_handler::<T, E>);

        let capabilities = warp::path!("capabilities")
            .and(warp::get())
            .and(with_runtime.clone())
            .and_then(capabilities_handler::<T, E>);

        let status = warp::path!("status")
            .and(warp::get())
            .and(with_runtime.clone())
            .and_then(status_handler::<T, E>);

        let metrics_enabled = self.metrics_enabled;
        let metrics = warp::path!("metrics")
            .and(warp::get())
            .and(warp::any().map(move || metrics_enabled))
            .and(with_runtime)
            .and_then(metrics_handler::<T, E>);

        let shutdown_tx = self.shutdown_tx.clone();
        let shutdown = warp::path!("shutdown")
            .and(warp::post())
            .and(warp::any().map(move || shutdown_tx.clone()))
            .and_then(shutdown_handler);

        health
            .or(submit)
            .or(lookup)
            .or(capabilities)
            .or(status)
            .or(metrics)
            .or(shutdown)
            .with(warp::cors().allow_any_origin())
    }

    /// Bind and serve until `shutdown` resolves. Returns the bound address
    /// (useful with port 0) and the server task.
    pub fn spawn(
        &self,
        addr: SocketAddr,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(SocketAddr, JoinHandle<()>), warp::Error> {
        let (bound, server) =
            warp::serve(self.routes()).try_bind_with_graceful_shutdown(addr, shutdown)?;
        info!(address = %bound, "HTTP API listening");
        Ok((bound, tokio::spawn(server)))
    }
}

fn reply(body: &impl Serialize, status: StatusCode) -> Result<JsonReply, Infallible> {
    Ok(warp::reply::with_status(warp::reply::json(body), status))
}

async fn health_handler<T: Transport, E: TaskExecutor>(
    runtime: Arc<AgentRuntime<T, E>>,
) -> Result<JsonReply, Infallible> {
    let state = runtime.state();
    let broker_connected = runtime.broker().is_connected();
    let healthy = state.is_running() && broker_connected;

    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        agent_id: runtime.identity().agent_id.clone(),
        state,
        broker_connected,
        active_tasks: runtime.registry().active_count(),
        uptime_seconds: runtime.uptime().as_secs(),
        timestamp: Utc::now(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    reply(&body, status)
}

async fn submit_handler<T: Transport, E: TaskExecutor>(
    submission: TaskSubmission,
    runtime: Arc<AgentRuntime<T, E>>,
) -> Result<JsonReply, Infallible> {
    let task_id = submission
        .task_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let message = TaskMessage {
        task_id: Some(task_id.clone()),
        task_type: submission.task_type,
        parameters: submission.parameters,
        malformed: None,
    };

    match runtime.submit_task(message).await {
        Intake::Accepted => reply(
            &json!({"taskId": task_id, "status": "submitted"}),
            StatusCode::OK,
        ),
        Intake::Duplicate => reply(
            &json!({"taskId": task_id, "status": "duplicate"}),
            StatusCode::CONFLICT,
        ),
        Intake::Rejected(result) => {
            let status = match &result.outcome {
                TaskOutcomeStatus::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
                TaskOutcomeStatus::Failed { error } if error.kind == error_kind::OVERLOADED => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::BAD_REQUEST,
            };
            reply(&result, status)
        }
        Intake::Dropped => reply(
            &json!({"error": "taskId cannot be used in a result subject"}),
            StatusCode::BAD_REQUEST,
        ),
    }
}

async fn task_handler<T: Transport, E: TaskExecutor>(
    task_id: String,
    runtime: Arc<AgentRuntime<T, E>>,
) -> Result<JsonReply, Infallible> {
    if let Some(task) = runtime.registry().get(&task_id) {
        return reply(
            &json!({
                "taskId": task.task_id,
                "type": task.task_type,
                "status": "processing",
                "receivedAt": task.received_at,
            }),
            StatusCode::OK,
        );
    }

    match runtime.task_result(&task_id) {
        Some(result) => reply(&result, StatusCode::OK),
        None => reply(
            &json!({"error": format!("Task not found: {task_id}")}),
            StatusCode::NOT_FOUND,
        ),
    }
}

async fn capabilities_handler<T: Transport, E: TaskExecutor>(
    runtime: Arc<AgentRuntime<T, E>>,
) -> Result<JsonReply, Infallible> {
    let identity = runtime.identity();
    let body = CapabilitiesResponse {
        agent_id: &identity.agent_id,
        agent_type: &identity.agent_type,
        version: &identity.version,
        capabilities: identity.capabilities.iter().map(String::as_str).collect(),
    };
    reply(&body, StatusCode::OK)
}

async fn status_handler<T: Transport, E: TaskExecutor>(
    runtime: Arc<AgentRuntime<T, E>>,
) -> Result<JsonReply, Infallible> {
    reply(&runtime.status_reply(), StatusCode::OK)
}

async fn metrics_handler<T: Transport, E: TaskExecutor>(
    enabled: bool,
    runtime: Arc<AgentRuntime<T, E>>,
) -> Result<JsonReply, Infallible> {
    if !enabled {
        return reply(
            &json!({"error": "Metrics are disabled"}),
            StatusCode::NOT_FOUND,
        );
    }
    reply(&runtime.metrics().snapshot(), StatusCode::OK)
}

async fn shutdown_handler(shutdown_tx: watch::Sender<bool>) -> Result<JsonReply, Infallible> {
    info!("Shutdown requested over HTTP");
    shutdown_tx.send_replace(true);
    reply(&json!({"status": "shutting_down"}), StatusCode::ACCEPTED)
}

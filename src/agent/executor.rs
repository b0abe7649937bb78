//! Task execution backend
//!
//! The runtime hands every admitted task to a [`TaskExecutor`] and turns
//! whatever comes back into a terminal result. Executors receive a
//! cancellation token and should return promptly once it fires; the runtime
//! ignores results that arrive after the task was cancelled.

use crate::protocol::TaskError;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// What an executor produced for a task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    /// The backend ran the task and reports a domain failure
    Failed(TaskError),
}

/// Executor-level failure. Each variant maps to a stable error kind label
/// that ends up in the published result.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Executor not initialized: {0}")]
    NotInitialized(String),
    #[error("Invalid task parameters: {0}")]
    InvalidParameters(String),
    #[error("Backend request failed: {0}")]
    Backend(String),
    #[error("Backend returned an unreadable response: {0}")]
    InvalidResponse(String),
    #[error("Task timed out after {0}s")]
    Timeout(u64),
    #[error("Task was cancelled")]
    Cancelled,
}

impl ExecutorError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorError::NotInitialized(_) => "ExecutorNotInitialized",
            ExecutorError::InvalidParameters(_) => "ValidationError",
            ExecutorError::Backend(_) => "ExecutionError",
            ExecutorError::InvalidResponse(_) => "InvalidResponse",
            ExecutorError::Timeout(_) => "Timeout",
            ExecutorError::Cancelled => crate::protocol::error_kind::CANCELLED,
        }
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Prepare the backend. Failure here is fatal to `start()`.
    async fn initialize(&self) -> Result<(), ExecutorError>;

    async fn process_task(
        &self,
        task_type: &str,
        parameters: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, ExecutorError>;
}

/// Executor used when no backend is configured. Completes every task with
/// its own type and parameters.
#[derive(Debug, Default, Clone)]
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn initialize(&self) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn process_task(
        &self,
        task_type: &str,
        parameters: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, ExecutorError> {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        Ok(TaskOutcome::Completed(json!({
            "taskType": task_type,
            "parameters": parameters,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_executor_returns_input() {
        let executor = EchoExecutor;
        executor.initialize().await.unwrap();

        let mut parameters = Map::new();
        parameters.insert("language".to_string(), json!("rust"));

        let outcome = executor
            .process_task("code-generation", parameters, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TaskOutcome::Completed(json!({
                "taskType": "code-generation",
                "parameters": {"language": "rust"}
            }))
        );
    }

    #[tokio::test]
    async fn test_echo_executor_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = EchoExecutor
            .process_task("code-generation", Map::new(), cancel)
            .await;
        assert!(matches!(result, Err(ExecutorError::Cancelled)));
    }

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(ExecutorError::Timeout(5).kind(), "Timeout");
        assert_eq!(ExecutorError::Backend("x".into()).kind(), "ExecutionError");
        assert_eq!(ExecutorError::Cancelled.kind(), "TaskCancelled");
        assert_eq!(
            ExecutorError::InvalidParameters("x".into()).kind(),
            "ValidationError"
        );
    }
}

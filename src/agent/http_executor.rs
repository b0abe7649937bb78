//! HTTP task backend
//!
//! POSTs `{"taskType", "parameters"}` to the configured endpoint and reads a
//! `{"status", "result", "errorMessage", "errorType"}` reply, where status is
//! `COMPLETED` or `FAILED` (case-insensitive).

use super::executor::{ExecutorError, TaskExecutor, TaskOutcome};
use crate::protocol::TaskError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpExecutorConfig {
    pub url: String,
    pub timeout: Duration,
}

impl Default for HttpExecutorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9000/process".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessRequest<'a> {
    task_type: &'a str,
    parameters: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

/// Turn a backend reply into an outcome (pure)
fn interpret_response(response: ProcessResponse) -> Result<TaskOutcome, ExecutorError> {
    let status = response.status.as_deref().unwrap_or("COMPLETED");
    if status.eq_ignore_ascii_case("completed") {
        Ok(TaskOutcome::Completed(response.result))
    } else if status.eq_ignore_ascii_case("failed") {
        let message = response
            .error_message
            .unwrap_or_else(|| "Task failed without an error message".to_string());
        let kind = response
            .error_type
            .unwrap_or_else(|| "ExecutionError".to_string());
        Ok(TaskOutcome::Failed(TaskError::new(kind, message)))
    } else {
        Err(ExecutorError::InvalidResponse(format!(
            "unknown status '{status}'"
        )))
    }
}

pub struct HttpTaskExecutor {
    config: HttpExecutorConfig,
    client: Client,
}

impl HttpTaskExecutor {
    pub fn new(config: HttpExecutorConfig) -> Result<Self, ExecutorError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExecutorError::NotInitialized(e.to_string()))?;
        Ok(Self { config, client })
    }

    async fn send(
        &self,
        task_type: &str,
        parameters: &Map<String, Value>,
    ) -> Result<TaskOutcome, ExecutorError> {
        let response = self
            .client
            .post(&self.config.url)
            .json(&ProcessRequest {
                task_type,
                parameters,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecutorError::Timeout(self.config.timeout.as_secs())
                } else {
                    warn!(
                        "Executor request failed: {} (is_connect: {})",
                        e,
                        e.is_connect()
                    );
                    ExecutorError::Backend(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutorError::Backend(format!("{status} - {body}")));
        }

        let reply: ProcessResponse = response
            .json()
            .await
            .map_err(|e| ExecutorError::InvalidResponse(e.to_string()))?;
        interpret_response(reply)
    }
}

#[async_trait]
impl TaskExecutor for HttpTaskExecutor {
    async fn initialize(&self) -> Result<(), ExecutorError> {
        reqwest::Url::parse(&self.config.url)
            .map_err(|e| ExecutorError::NotInitialized(format!("{}: {e}", self.config.url)))?;
        debug!(url = %self.config.url, "HTTP executor ready");
        Ok(())
    }

    async fn process_task(
        &self,
        task_type: &str,
        parameters: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, ExecutorError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
            outcome = self.send(task_type, &parameters) => outcome,
        }
    }
}

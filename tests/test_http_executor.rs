//! Integration tests for the HTTP task executor
//!
//! Request shape, reply interpretation, backend failures, timeouts and
//! cancellation against a mock backend.

use bridge_agent::agent::{ExecutorError, HttpExecutorConfig, HttpTaskExecutor, TaskExecutor, TaskOutcome};
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn executor(server: &MockServer, timeout: Duration) -> HttpTaskExecutor {
    HttpTaskExecutor::new(HttpExecutorConfig {
        url: format!("{}/process", server.uri()),
        timeout,
    })
    .unwrap()
}

fn params(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn test_posts_task_and_returns_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/process"))
        .and(body_json(json!({
            "taskType": "code-generation",
            "parameters": {"language": "rust"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "COMPLETED",
            "result": {"code": "fn main() {}"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let executor = executor(&server, Duration::from_secs(5));
    executor.initialize().await.unwrap();
    let outcome = executor
        .process_task(
            "code-generation",
            params(json!({"language": "rust"})),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, TaskOutcome::Completed(json!({"code": "fn main() {}"})));
}

#[tokio::test]
async fn test_backend_reported_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "FAILED",
            "errorMessage": "UVC file is corrupt",
            "errorType": "AnalysisError"
        })))
        .mount(&server)
        .await;

    let outcome = executor(&server, Duration::from_secs(5))
        .process_task("uvc-analysis", Map::new(), CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        TaskOutcome::Failed(error) => {
            assert_eq!(error.kind, "AnalysisError");
            assert_eq!(error.message, "UVC file is corrupt");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_http_error_status_is_backend_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .mount(&server)
        .await;

    let result = executor(&server, Duration::from_secs(5))
        .process_task("code-generation", Map::new(), CancellationToken::new())
        .await;

    match result {
        Err(ExecutorError::Backend(message)) => {
            assert!(message.contains("500"));
            assert!(message.contains("internal error"));
        }
        other => panic!("expected backend error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_non_json_reply_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let result = executor(&server, Duration::from_secs(5))
        .process_task("code-generation", Map::new(), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(ExecutorError::InvalidResponse(_))));
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "COMPLETED"}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let result = executor(&server, Duration::from_millis(200))
        .process_task("code-generation", Map::new(), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(ExecutorError::Timeout(_))));
}

#[tokio::test]
async fn test_cancellation_interrupts_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "COMPLETED"}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let executor = executor(&server, Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let began = Instant::now();
    let result = executor
        .process_task("code-generation", Map::new(), cancel)
        .await;
    assert!(matches!(result, Err(ExecutorError::Cancelled)));
    assert!(began.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_unreachable_backend() {
    let executor = HttpTaskExecutor::new(HttpExecutorConfig {
        url: "http://127.0.0.1:9/process".to_string(),
        timeout: Duration::from_secs(2),
    })
    .unwrap();

    let result = executor
        .process_task("code-generation", Map::new(), CancellationToken::new())
        .await;
    assert!(matches!(
        result,
        Err(ExecutorError::Backend(_)) | Err(ExecutorError::Timeout(_))
    ));
}

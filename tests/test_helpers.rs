//! Test helpers and utilities for integration tests

use bridge_agent::agent::{AgentIdentity, AgentRuntime, RuntimeSettings};
use bridge_agent::protocol::{MessageCodec, TaskResult, SubjectBuilder};
use bridge_agent::testing::{MemoryBus, MemoryTransport, MockExecutor};
use bridge_agent::transport::{BrokerConnection, RetryPolicy};
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const AGENT_ID: &str = "bridge-test";

#[allow(dead_code)]
pub type TestRuntime = AgentRuntime<MemoryTransport, MockExecutor>;

#[allow(dead_code)]
pub fn test_identity() -> AgentIdentity {
    AgentIdentity::new(
        AGENT_ID,
        "python-bridge",
        ["code-generation", "documentation-generation"],
        "0.1.0",
    )
}

/// Fast settings: one connection attempt, no heartbeat within a test's lifetime
#[allow(dead_code)]
pub fn test_settings() -> RuntimeSettings {
    RuntimeSettings {
        broker_url: "memory://test".to_string(),
        retry: RetryPolicy::immediate(1),
        health_interval: Duration::from_secs(3600),
        shutdown_grace: Duration::from_secs(1),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn test_runtime(bus: &MemoryBus, executor: MockExecutor) -> Arc<TestRuntime> {
    test_runtime_with(bus, executor, test_settings())
}

#[allow(dead_code)]
pub fn test_runtime_with(
    bus: &MemoryBus,
    executor: MockExecutor,
    settings: RuntimeSettings,
) -> Arc<TestRuntime> {
    AgentRuntime::new(
        test_identity(),
        settings,
        BrokerConnection::new(bus.transport()),
        executor,
    )
}

/// Publish a raw JSON value on this agent's task subject
#[allow(dead_code)]
pub fn inject_task(bus: &MemoryBus, task: Value) -> usize {
    bus.inject(
        &SubjectBuilder::task(AGENT_ID),
        Bytes::from(task.to_string()),
    )
}

#[allow(dead_code)]
pub fn inject_control(bus: &MemoryBus, command: Value) -> usize {
    bus.inject(
        &SubjectBuilder::control(AGENT_ID),
        Bytes::from(command.to_string()),
    )
}

/// Wait for `count` results for `task_id` and decode them
#[allow(dead_code)]
pub async fn wait_for_results(bus: &MemoryBus, task_id: &str, count: usize) -> Vec<TaskResult> {
    bus.wait_for_messages(
        &SubjectBuilder::task_result(task_id),
        count,
        Duration::from_secs(5),
    )
    .await
    .unwrap_or_else(|| panic!("timed out waiting for {count} result(s) for {task_id}"))
    .iter()
    .map(|payload| MessageCodec::decode(payload).unwrap())
    .collect()
}

/// Poll until `condition` holds or a few seconds pass
#[allow(dead_code)]
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

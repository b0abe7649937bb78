//! Mock task executor
//!
//! Scriptable stand-in for a real backend. Clones share state, so a test can
//! keep one handle and give the other to the runtime.

use crate::agent::{ExecutorError, TaskExecutor, TaskOutcome};
use crate::protocol::TaskError;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the mock does with a task
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Complete immediately, echoing type and parameters
    Complete,
    /// Complete immediately with this result
    Respond(Value),
    /// Report a domain failure
    Fail(TaskError),
    /// Return an executor error with this message
    Error(String),
    /// Complete after the delay unless cancelled first
    Delay(Duration),
    /// Complete after the delay, ignoring cancellation
    Stall(Duration),
    /// Panic with this message
    Panic(String),
}

#[derive(Debug, Default)]
struct MockState {
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    cancelled: AtomicUsize,
    finished: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct MockExecutor {
    default_behavior: MockBehavior,
    per_type: HashMap<String, MockBehavior>,
    fail_initialize: bool,
    state: Arc<MockState>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            default_behavior: MockBehavior::Complete,
            per_type: HashMap::new(),
            fail_initialize: false,
            state: Arc::new(MockState::default()),
        }
    }

    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    /// Override the behavior for one task type
    pub fn with_task_behavior(mut self, task_type: impl Into<String>, behavior: MockBehavior) -> Self {
        self.per_type.insert(task_type.into(), behavior);
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Task types received, in call order
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state.calls)
            .iter()
            .map(|(task_type, _)| task_type.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.state.calls).len()
    }

    pub fn last_parameters(&self) -> Option<Map<String, Value>> {
        lock(&self.state.calls).last().map(|(_, p)| p.clone())
    }

    /// Highest number of tasks that were executing at once
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Tasks that returned because their token fired
    pub fn cancelled_count(&self) -> usize {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Tasks that ran to the end of their behavior
    pub fn finished_count(&self) -> usize {
        self.state.finished.load(Ordering::SeqCst)
    }

    fn behavior_for(&self, task_type: &str) -> MockBehavior {
        self.per_type
            .get(task_type)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone())
    }
}

struct InFlight<'a>(&'a MockState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskExecutor for MockExecutor {
    async fn initialize(&self) -> Result<(), ExecutorError> {
        if self.fail_initialize {
            return Err(ExecutorError::NotInitialized(
                "mock backend unavailable".to_string(),
            ));
        }
        Ok(())
    }

    async fn process_task(
        &self,
        task_type: &str,
        parameters: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, ExecutorError> {
        lock(&self.state.calls).push((task_type.to_string(), parameters.clone()));
        let _in_flight = InFlight::enter(&self.state);
        let echo = json!({"taskType": task_type, "parameters": parameters});

        let outcome = match self.behavior_for(task_type) {
            MockBehavior::Complete => Ok(TaskOutcome::Completed(echo)),
            MockBehavior::Respond(value) => Ok(TaskOutcome::Completed(value)),
            MockBehavior::Fail(error) => Ok(TaskOutcome::Failed(error)),
            MockBehavior::Error(message) => Err(ExecutorError::Backend(message)),
            MockBehavior::Delay(delay) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.state.cancelled.fetch_add(1, Ordering::SeqCst);
                        return Err(ExecutorError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => Ok(TaskOutcome::Completed(echo)),
                }
            }
            MockBehavior::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Ok(TaskOutcome::Completed(echo))
            }
            MockBehavior::Panic(message) => panic!("{message}"),
        };

        self.state.finished.fetch_add(1, Ordering::SeqCst);
        outcome
    }
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

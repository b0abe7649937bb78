//! In-flight task table and result cache
//!
//! One mutex guards every piece of state, so admission, claiming and
//! completion are atomic with respect to each other and to
//! [`TaskRegistry::active_count`].

use crate::protocol::TaskResult;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Finished results kept for duplicate detection and `GET /task/{id}`
pub const DEFAULT_RESULT_CACHE_CAPACITY: usize = 1024;

/// A task accepted for execution
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub task_id: String,
    pub task_type: String,
    pub parameters: Map<String, Value>,
    pub received_at: DateTime<Utc>,
    started: Instant,
}

impl AgentTask {
    pub fn new(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        parameters: Map<String, Value>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            parameters,
            received_at: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Time since the task was received
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    /// Claimed; its result is being published
    Finalizing,
}

struct Entry {
    task: AgentTask,
    phase: Phase,
    cancel: CancellationToken,
}

/// Result of [`TaskRegistry::admit`]
#[derive(Debug)]
pub enum Admission {
    /// Registered; the token is cancelled if the runtime stops first
    Accepted(CancellationToken),
    /// Already active or already finished
    Duplicate,
    /// `max_in_flight` tasks are already running
    Overloaded { limit: usize },
    /// Intake is closed for shutdown
    Closed,
}

/// Active task handed over by [`TaskRegistry::close_intake`]
#[derive(Debug)]
pub struct ClaimedTask {
    pub task: AgentTask,
    pub cancel: CancellationToken,
}

struct State {
    active: HashMap<String, Entry>,
    finished: HashMap<String, TaskResult>,
    finished_order: VecDeque<String>,
    intake_open: bool,
}

pub struct TaskRegistry {
    state: Mutex<State>,
    idle: Notify,
    cache_capacity: usize,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::with_cache_capacity(DEFAULT_RESULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(cache_capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                active: HashMap::new(),
                finished: HashMap::new(),
                finished_order: VecDeque::new(),
                intake_open: false,
            }),
            idle: Notify::new(),
            cache_capacity: cache_capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert a task regardless of intake state. Returns `None` if the id is
    /// already active.
    pub fn put(&self, task: AgentTask) -> Option<CancellationToken> {
        let mut state = self.lock();
        if state.active.contains_key(&task.task_id) {
            return None;
        }
        let cancel = CancellationToken::new();
        state.active.insert(
            task.task_id.clone(),
            Entry {
                task,
                phase: Phase::Active,
                cancel: cancel.clone(),
            },
        );
        Some(cancel)
    }

    /// Remove an active task without recording a result
    pub fn remove(&self, task_id: &str) -> Option<AgentTask> {
        let removed = self.lock().active.remove(task_id).map(|entry| entry.task);
        self.notify_if_idle();
        removed
    }

    pub fn get(&self, task_id: &str) -> Option<AgentTask> {
        self.lock()
            .active
            .get(task_id)
            .map(|entry| entry.task.clone())
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Active tasks, oldest first
    pub fn snapshot(&self) -> Vec<AgentTask> {
        let mut tasks: Vec<AgentTask> = self
            .lock()
            .active
            .values()
            .map(|entry| entry.task.clone())
            .collect();
        tasks.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        tasks
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|task| task.task_id).collect()
    }

    /// Admit a task for execution: the intake-closed, duplicate and overload
    /// checks and the insert happen under one lock
    pub fn admit(&self, task: AgentTask, max_in_flight: Option<usize>) -> Admission {
        let mut state = self.lock();
        if !state.intake_open {
            return Admission::Closed;
        }
        if state.active.contains_key(&task.task_id) || state.finished.contains_key(&task.task_id)
        {
            return Admission::Duplicate;
        }
        if let Some(limit) = max_in_flight {
            if state.active.len() >= limit {
                return Admission::Overloaded { limit };
            }
        }

        let cancel = CancellationToken::new();
        state.active.insert(
            task.task_id.clone(),
            Entry {
                task,
                phase: Phase::Active,
                cancel: cancel.clone(),
            },
        );
        Admission::Accepted(cancel)
    }

    /// Take the exclusive right to publish the terminal result. Succeeds once
    /// per admitted task.
    pub fn claim(&self, task_id: &str) -> bool {
        let mut state = self.lock();
        match state.active.get_mut(task_id) {
            Some(entry) if entry.phase == Phase::Active => {
                entry.phase = Phase::Finalizing;
                true
            }
            _ => false,
        }
    }

    /// Remove a claimed task and cache its result
    pub fn complete(&self, task_id: &str, result: TaskResult) {
        {
            let mut state = self.lock();
            state.active.remove(task_id);
            self.cache_result(&mut state, result);
        }
        self.notify_if_idle();
    }

    /// Cache a result for a task that was never admitted
    pub fn record_result(&self, result: TaskResult) {
        let mut state = self.lock();
        self.cache_result(&mut state, result);
    }

    fn cache_result(&self, state: &mut State, result: TaskResult) {
        let task_id = result.task_id.clone();
        if state.finished.insert(task_id.clone(), result).is_none() {
            state.finished_order.push_back(task_id);
        }
        while state.finished_order.len() > self.cache_capacity {
            if let Some(oldest) = state.finished_order.pop_front() {
                state.finished.remove(&oldest);
            }
        }
    }

    pub fn result(&self, task_id: &str) -> Option<TaskResult> {
        self.lock().finished.get(task_id).cloned()
    }

    /// Active or finished
    pub fn is_known(&self, task_id: &str) -> bool {
        let state = self.lock();
        state.active.contains_key(task_id) || state.finished.contains_key(task_id)
    }

    pub fn finished_count(&self) -> usize {
        self.lock().finished.len()
    }

    /// Drop cached results of tasks that are no longer active
    pub fn clear_finished(&self) -> usize {
        let mut state = self.lock();
        let cleared = state.finished.len();
        state.finished.clear();
        state.finished_order.clear();
        cleared
    }

    pub fn reopen_intake(&self) {
        self.lock().intake_open = true;
    }

    pub fn is_intake_open(&self) -> bool {
        self.lock().intake_open
    }

    /// Stop admitting tasks and claim every task that has not started
    /// finalizing. The caller owns publishing their results.
    pub fn close_intake(&self) -> Vec<ClaimedTask> {
        let mut state = self.lock();
        state.intake_open = false;
        state
            .active
            .values_mut()
            .filter(|entry| entry.phase == Phase::Active)
            .map(|entry| {
                entry.phase = Phase::Finalizing;
                ClaimedTask {
                    task: entry.task.clone(),
                    cancel: entry.cancel.clone(),
                }
            })
            .collect()
    }

    /// Wait until no task is active. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    fn notify_if_idle(&self) {
        if self.active_count() == 0 {
            self.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn task(id: &str) -> AgentTask {
        AgentTask::new(id, "code-generation", Map::new())
    }

    fn open_registry() -> TaskRegistry {
        let registry = TaskRegistry::new();
        registry.reopen_intake();
        registry
    }

    #[test]
    fn test_admit_requires_open_intake() {
        let registry = TaskRegistry::new();
        assert!(matches!(registry.admit(task("t1"), None), Admission::Closed));
        registry.reopen_intake();
        assert!(matches!(registry.admit(task("t1"), None), Admission::Accepted(_)));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_admit_rejects_duplicates_active_and_finished() {
        let registry = open_registry();
        assert!(matches!(registry.admit(task("t1"), None), Admission::Accepted(_)));
        assert!(matches!(registry.admit(task("t1"), None), Admission::Duplicate));

        assert!(registry.claim("t1"));
        registry.complete("t1", TaskResult::cancelled("t1", 0));
        assert!(matches!(registry.admit(task("t1"), None), Admission::Duplicate));
        assert!(registry.is_known("t1"));
    }

    #[test]
    fn test_admit_enforces_limit() {
        let registry = open_registry();
        assert!(matches!(registry.admit(task("a"), Some(2)), Admission::Accepted(_)));
        assert!(matches!(registry.admit(task("b"), Some(2)), Admission::Accepted(_)));
        assert!(matches!(
            registry.admit(task("c"), Some(2)),
            Admission::Overloaded { limit: 2 }
        ));
    }

    #[test]
    fn test_claim_succeeds_once() {
        let registry = open_registry();
        registry.admit(task("t1"), None);
        assert!(registry.claim("t1"));
        assert!(!registry.claim("t1"));
        assert!(!registry.claim("unknown"));
        // still counted until completed
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_close_intake_claims_only_unclaimed_tasks() {
        let registry = open_registry();
        registry.admit(task("running"), None);
        registry.admit(task("finishing"), None);
        assert!(registry.claim("finishing"));

        let claimed = registry.close_intake();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].task.task_id, "running");
        assert!(!registry.claim("running"));
        assert!(!registry.is_intake_open());
    }

    #[test]
    fn test_put_get_remove() {
        let registry = TaskRegistry::new();
        assert!(registry.put(task("t1")).is_some());
        assert!(registry.put(task("t1")).is_none());
        assert_eq!(registry.get("t1").map(|t| t.task_type), Some("code-generation".to_string()));
        assert!(registry.remove("t1").is_some());
        assert!(registry.get("t1").is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_result_cache_is_bounded() {
        let registry = TaskRegistry::with_cache_capacity(2);
        registry.record_result(TaskResult::cancelled("a", 0));
        registry.record_result(TaskResult::cancelled("b", 0));
        registry.record_result(TaskResult::cancelled("c", 0));

        assert!(registry.result("a").is_none());
        assert!(registry.result("b").is_some());
        assert!(registry.result("c").is_some());
        assert_eq!(registry.clear_finished(), 2);
        assert_eq!(registry.finished_count(), 0);
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let registry = Arc::new(open_registry());
        registry.admit(task("contended"), None);

        let winners: usize = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.claim("contended"))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| usize::from(handle.join().unwrap()))
            .sum();

        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let registry = Arc::new(open_registry());
        registry.admit(task("t1"), None);
        assert!(!registry.wait_idle(Duration::from_millis(10)).await);

        let finisher = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                registry.claim("t1");
                registry.complete("t1", TaskResult::cancelled("t1", 0));
            })
        };
        assert!(registry.wait_idle(Duration::from_secs(1)).await);
        finisher.await.unwrap();
    }
}

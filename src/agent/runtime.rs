//! Agent runtime state machine
//!
//! `Initializing -> Registering -> Ready <-> Processing -> Stopping -> Stopped`,
//! with `Error` on an unrecoverable setup failure. `Processing` is never
//! stored: it is `Ready` with at least one active task.
//!
//! Inbound messages arrive through one consumer task per subscription, so a
//! subscription's messages are handled in bus order. Each admitted task runs
//! in its own spawned task and intake never waits for execution.

use super::executor::{TaskExecutor, TaskOutcome};
use super::registry::{Admission, AgentTask, ClaimedTask, TaskRegistry};
use crate::error::sanitize_error_message;
use crate::health::{HealthReporter, HealthSource, ProcessSampler};
use crate::observability::metrics::MetricsCollector;
use crate::protocol::{
    error_kind, ControlCommand, ControlMessage, HealthReport, MessageCodec, ProcessMetrics,
    Registration, RuntimeState, StatusReply, SubjectBuilder, TaskError, TaskMessage,
    TaskOutcomeStatus, TaskResult, Unregistration, REGISTRATION_SUBJECT,
    UNREGISTRATION_SUBJECT, validate_subject,
};
use crate::transport::{
    BrokerConnection, BrokerError, InboundMessage, RetryPolicy, SubscriptionHandle, Transport,
};
use crate::{lifecycle_span, task_span};
use chrono::Utc;
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Message bus error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Executor initialization failed: {0}")]
    Executor(#[from] super::executor::ExecutorError),
    #[error("Could not publish to '{0}'")]
    PublishFailed(String),
}

/// Who this agent is. Fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
    pub version: String,
}

impl AgentIdentity {
    pub fn new<I, S>(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: I,
        version: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            version: version.into(),
        }
    }

    pub fn supports(&self, task_type: &str) -> bool {
        self.capabilities.contains(task_type)
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub broker_url: String,
    pub retry: RetryPolicy,
    /// Queue group for the task subscription
    pub queue_group: Option<String>,
    pub health_interval: Duration,
    pub max_in_flight: Option<usize>,
    /// How long `stop()` waits for results that are already being published
    pub shutdown_grace: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            broker_url: "memory://local".to_string(),
            retry: RetryPolicy::default(),
            queue_group: None,
            health_interval: Duration::from_secs(30),
            max_in_flight: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// What intake did with an inbound task
#[derive(Debug, Clone, PartialEq)]
pub enum Intake {
    /// Registered and handed to the executor
    Accepted,
    /// Answered immediately with this result
    Rejected(TaskResult),
    /// Same task id already active or finished
    Duplicate,
    /// Undecodable or without a task id; nothing was published
    Dropped,
}

struct Session {
    reporter: HealthReporter,
    subscriptions: Vec<SubscriptionHandle>,
}

pub struct AgentRuntime<T: Transport, E: TaskExecutor> {
    identity: AgentIdentity,
    settings: RuntimeSettings,
    broker: Arc<BrokerConnection<T>>,
    executor: Arc<E>,
    registry: Arc<TaskRegistry>,
    metrics: Arc<MetricsCollector>,
    state_tx: watch::Sender<RuntimeState>,
    lifecycle: tokio::sync::Mutex<()>,
    registered: AtomicBool,
    session: Mutex<Option<Session>>,
    sampler: Mutex<ProcessSampler>,
    started_at: Instant,
}

impl<T: Transport, E: TaskExecutor> AgentRuntime<T, E> {
    pub fn new(
        identity: AgentIdentity,
        settings: RuntimeSettings,
        broker: BrokerConnection<T>,
        executor: E,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(RuntimeState::Initializing);
        let metrics = Arc::clone(broker.metrics());
        Arc::new(Self {
            identity,
            settings,
            broker: Arc::new(broker),
            executor: Arc::new(executor),
            registry: Arc::new(TaskRegistry::new()),
            metrics,
            state_tx,
            lifecycle: tokio::sync::Mutex::new(()),
            registered: AtomicBool::new(false),
            session: Mutex::new(None),
            sampler: Mutex::new(ProcessSampler::new()),
            started_at: Instant::now(),
        })
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn broker(&self) -> &Arc<BrokerConnection<T>> {
        &self.broker
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Current state, with `Processing` derived from the active task count
    pub fn state(&self) -> RuntimeState {
        let stored = *self.state_tx.borrow();
        if stored == RuntimeState::Ready && self.registry.active_count() > 0 {
            RuntimeState::Processing
        } else {
            stored
        }
    }

    /// Watch stored state transitions (never `Processing`)
    pub fn state_receiver(&self) -> watch::Receiver<RuntimeState> {
        self.state_tx.subscribe()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn stored_state(&self) -> RuntimeState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: RuntimeState) {
        let previous = self.state_tx.send_replace(next);
        self.metrics.set_agent_state(next.as_str());
        if previous != next {
            info!(agent_id = %self.identity.agent_id, from = %previous, to = %next, "State transition");
        }
    }

    /// Connect, register, subscribe and begin heartbeats. A no-op while
    /// running; from `Stopped` or `Error` it starts a fresh session.
    pub async fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        let _guard = self.lifecycle.lock().await;
        if self.stored_state().is_running() {
            debug!("start() called while running");
            return Ok(());
        }

        let span = lifecycle_span!(operation = "start", agent_id = %self.identity.agent_id);
        self.start_session().instrument(span).await
    }

    async fn start_session(self: &Arc<Self>) -> Result<(), RuntimeError> {
        self.set_state(RuntimeState::Initializing);

        if let Err(e) = self
            .broker
            .connect(&self.settings.broker_url, &self.settings.retry)
            .await
        {
            error!(error = %e, "Could not connect to the message bus");
            self.set_state(RuntimeState::Error);
            return Err(e.into());
        }

        if let Err(e) = self.executor.initialize().await {
            error!(error = %e, "Task executor failed to initialize");
            self.abort_start().await;
            return Err(e.into());
        }

        self.set_state(RuntimeState::Registering);
        let registration = Registration {
            agent_id: self.identity.agent_id.clone(),
            agent_type: self.identity.agent_type.clone(),
            capabilities: self.identity.capabilities.iter().cloned().collect(),
            status: RuntimeState::Registering,
            registration_time: Utc::now(),
            version: self.identity.version.clone(),
        };
        if !self
            .broker
            .publish_message(REGISTRATION_SUBJECT, &registration)
            .await
        {
            error!("Registration could not be published");
            self.abort_start().await;
            return Err(RuntimeError::PublishFailed(REGISTRATION_SUBJECT.to_string()));
        }
        self.registered.store(true, Ordering::SeqCst);
        info!(
            capabilities = ?registration.capabilities,
            "Registered with orchestrator"
        );

        self.registry.reopen_intake();
        let subscriptions = match self.subscribe_intake().await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                error!(error = %e, "Could not subscribe to agent subjects");
                self.abort_start().await;
                return Err(e.into());
            }
        };

        let source: Arc<dyn HealthSource> = self.clone();
        let reporter = HealthReporter::spawn(
            source,
            Arc::clone(&self.broker),
            self.settings.health_interval,
        );
        *lock(&self.session) = Some(Session {
            reporter,
            subscriptions,
        });

        self.set_state(RuntimeState::Ready);
        Ok(())
    }

    /// Undo a partial start and land in `Error`
    async fn abort_start(&self) {
        self.registry.close_intake();
        self.unregister().await;
        self.broker.close().await;
        self.set_state(RuntimeState::Error);
    }

    async fn subscribe_intake(self: &Arc<Self>) -> Result<Vec<SubscriptionHandle>, BrokerError> {
        let agent_id = &self.identity.agent_id;

        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let task_subscription = self
            .broker
            .subscribe(
                &SubjectBuilder::task(agent_id),
                task_tx,
                self.settings.queue_group.as_deref(),
            )
            .await?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let control_subscription = self
            .broker
            .subscribe(&SubjectBuilder::control(agent_id), control_tx, None)
            .await?;

        self.spawn_task_loop(task_rx);
        self.spawn_control_loop(control_rx);
        Ok(vec![task_subscription, control_subscription])
    }

    // Both loops end when the broker drops the subscription's sender on close
    fn spawn_task_loop(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                runtime.handle_task_message(&message.payload).await;
            }
            debug!("Task intake loop ended");
        });
    }

    fn spawn_control_loop(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                match MessageCodec::decode_control(&message.payload) {
                    Ok(control) => runtime.handle_control(control).await,
                    Err(e) => warn!(error = %e, "Dropping undecodable control message"),
                }
            }
            debug!("Control loop ended");
        });
    }

    /// Decode and admit a task payload from the bus
    pub async fn handle_task_message(self: &Arc<Self>, payload: &[u8]) -> Intake {
        match MessageCodec::decode_task(payload) {
            Ok(message) => self.submit_task(message).await,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable task message");
                Intake::Dropped
            }
        }
    }

    /// Run a task through intake validation and, if admitted, start it
    pub async fn submit_task(self: &Arc<Self>, message: TaskMessage) -> Intake {
        let Some(task_id) = message.task_id.filter(|id| !id.trim().is_empty()) else {
            warn!("Dropping task without taskId");
            return Intake::Dropped;
        };
        // No result could ever be published for this id
        if let Err(e) = validate_subject(&SubjectBuilder::task_result(&task_id)) {
            warn!(task_id = %task_id, error = %e, "Dropping task with unusable taskId");
            return Intake::Dropped;
        }
        self.metrics.task_received();

        if self.registry.is_known(&task_id) {
            info!(task_id = %task_id, "Ignoring duplicate task delivery");
            return Intake::Duplicate;
        }

        if !self.registry.is_intake_open() {
            return self.reject(TaskResult::cancelled(task_id, 0)).await;
        }

        if let Some(problem) = message.malformed {
            let error = TaskError::new(error_kind::VALIDATION, problem);
            return self.reject(TaskResult::failed(task_id, error, 0)).await;
        }

        let Some(task_type) = message.task_type.filter(|t| !t.trim().is_empty()) else {
            let error = TaskError::new(error_kind::VALIDATION, "Task type not specified");
            return self.reject(TaskResult::failed(task_id, error, 0)).await;
        };

        if !self.identity.supports(&task_type) {
            let error = TaskError::new(
                error_kind::UNSUPPORTED_TASK,
                format!("Unsupported task type: {task_type}"),
            );
            return self.reject(TaskResult::failed(task_id, error, 0)).await;
        }

        let task = AgentTask::new(task_id.clone(), task_type, message.parameters);
        match self.registry.admit(task.clone(), self.settings.max_in_flight) {
            Admission::Accepted(cancel) => {
                info!(task_id = %task_id, task_type = %task.task_type, "Task accepted");
                let runtime = Arc::clone(self);
                tokio::spawn(async move { runtime.run_task(task, cancel).await });
                Intake::Accepted
            }
            Admission::Duplicate => {
                info!(task_id = %task_id, "Ignoring duplicate task delivery");
                Intake::Duplicate
            }
            Admission::Overloaded { limit } => {
                let error = TaskError::new(
                    error_kind::OVERLOADED,
                    format!("Agent is at capacity ({limit} tasks in flight)"),
                );
                self.reject(TaskResult::failed(task_id, error, 0)).await
            }
            Admission::Closed => self.reject(TaskResult::cancelled(task_id, 0)).await,
        }
    }

    async fn reject(&self, result: TaskResult) -> Intake {
        warn!(
            task_id = %result.task_id,
            status = result.status_label(),
            reason = result.error().map(|e| e.message.as_str()).unwrap_or_default(),
            "Task rejected at intake"
        );
        self.metrics.task_rejected();
        self.registry.record_result(result.clone());
        self.publish_result(&result).await;
        Intake::Rejected(result)
    }

    async fn run_task(self: Arc<Self>, task: AgentTask, cancel: CancellationToken) {
        let span = task_span!(task_id = %task.task_id, task_type = %task.task_type);
        async move {
            self.metrics.task_started();

            // A separate task isolates executor panics from the runtime
            let executor = Arc::clone(&self.executor);
            let task_type = task.task_type.clone();
            let parameters = task.parameters.clone();
            let joined = tokio::spawn(async move {
                executor.process_task(&task_type, parameters, cancel).await
            })
            .await;

            let elapsed = task.elapsed();
            let elapsed_ms = elapsed.as_millis() as u64;
            let result = match joined {
                Ok(Ok(TaskOutcome::Completed(data))) => {
                    TaskResult::completed(&task.task_id, data, elapsed_ms)
                }
                Ok(Ok(TaskOutcome::Failed(error))) => TaskResult::failed(
                    &task.task_id,
                    TaskError::new(error.kind, sanitize_error_message(&error.message)),
                    elapsed_ms,
                ),
                Ok(Err(e)) => TaskResult::failed(
                    &task.task_id,
                    TaskError::new(e.kind(), sanitize_error_message(&e.to_string())),
                    elapsed_ms,
                ),
                Err(join_error) => {
                    let detail = if join_error.is_panic() {
                        panic_message(join_error.into_panic())
                    } else {
                        "execution aborted".to_string()
                    };
                    error!(panic = %detail, "Task executor panicked");
                    TaskResult::failed(
                        &task.task_id,
                        TaskError::new(
                            error_kind::PANIC,
                            sanitize_error_message(&format!("Task execution panicked: {detail}")),
                        ),
                        elapsed_ms,
                    )
                }
            };

            if !self.registry.claim(&task.task_id) {
                debug!("Task already finalized; discarding late result");
                return;
            }

            self.publish_result(&result).await;
            match result.outcome {
                TaskOutcomeStatus::Completed { .. } => self.metrics.task_completed(elapsed),
                _ => self.metrics.task_failed(elapsed),
            }
            self.registry.complete(&task.task_id, result);
        }
        .instrument(span)
        .await
    }

    async fn publish_result(&self, result: &TaskResult) -> bool {
        let subject = SubjectBuilder::task_result(&result.task_id);
        let published = self.broker.publish_message(&subject, result).await;
        if published {
            info!(
                task_id = %result.task_id,
                status = result.status_label(),
                processing_time_ms = result.processing_time_ms,
                "Published task result"
            );
        } else {
            error!(task_id = %result.task_id, "Task result could not be published");
        }
        published
    }

    /// Apply a control command. If the command fails and leaves the runtime
    /// in a transitional state, the state from before the command returns.
    pub async fn handle_control(self: &Arc<Self>, message: ControlMessage) {
        let prior = self.stored_state();
        let command = message.command();
        info!(command = %message.command, "Control command received");

        let outcome = match command {
            ControlCommand::Stop => {
                self.stop().await;
                Ok(())
            }
            ControlCommand::Status => self.reply_status(message.reply_to.as_deref()).await,
            ControlCommand::Restart => self.restart().await,
            ControlCommand::ClearTasks => {
                let cleared = self.registry.clear_finished();
                info!(cleared, "Cleared finished task results");
                Ok(())
            }
            ControlCommand::Unknown(name) => {
                warn!(command = %name, "Ignoring unknown control command");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            error!(command = %message.command, error = %e, "Control command failed");
            let current = self.stored_state();
            if current.is_transitional() {
                warn!(from = %current, to = %prior, "Restoring state after failed command");
                self.set_state(prior);
            }
        }
    }

    async fn reply_status(&self, reply_to: Option<&str>) -> Result<(), RuntimeError> {
        let subject = reply_to
            .map(str::to_string)
            .unwrap_or_else(|| SubjectBuilder::status(&self.identity.agent_id));
        let reply = self.status_reply();
        if self.broker.publish_message(&subject, &reply).await {
            Ok(())
        } else {
            Err(RuntimeError::PublishFailed(subject))
        }
    }

    /// Tear the session down and start a fresh one without passing through
    /// `Stopped`.
    pub async fn restart(self: &Arc<Self>) -> Result<(), RuntimeError> {
        let _guard = self.lifecycle.lock().await;
        info!("Restarting agent");

        let span = lifecycle_span!(operation = "restart", agent_id = %self.identity.agent_id);
        async {
            if self.stored_state() != RuntimeState::Stopped {
                self.shutdown_session(RuntimeState::Initializing).await;
            }
            self.start_session().await
        }
        .instrument(span)
        .await
    }

    /// Cancel in-flight work, unregister and disconnect. A second call is a
    /// no-op.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.stored_state() == RuntimeState::Stopped {
            debug!("stop() called while stopped");
            return;
        }

        let span = lifecycle_span!(operation = "stop", agent_id = %self.identity.agent_id);
        self.shutdown_session(RuntimeState::Stopped)
            .instrument(span)
            .await
    }

    async fn shutdown_session(&self, final_state: RuntimeState) {
        self.set_state(RuntimeState::Stopping);
        let claimed = self.registry.close_intake();

        let session = lock(&self.session).take();
        if let Some(session) = session {
            session.reporter.stop().await;
            debug!(subscriptions = session.subscriptions.len(), "Session torn down");
        }

        for ClaimedTask { task, cancel } in claimed {
            cancel.cancel();
            let result = TaskResult::cancelled(&task.task_id, task.elapsed_ms());
            self.publish_result(&result).await;
            self.metrics.task_cancelled(task.elapsed());
            self.registry.complete(&task.task_id, result);
        }

        if !self.registry.wait_idle(self.settings.shutdown_grace).await {
            warn!(
                remaining = self.registry.active_count(),
                "Tasks still finalizing at shutdown"
            );
        }

        self.unregister().await;
        self.broker.close().await;
        self.set_state(final_state);
    }

    async fn unregister(&self) {
        if !self.registered.swap(false, Ordering::SeqCst) {
            return;
        }
        let unregistration = Unregistration {
            agent_id: self.identity.agent_id.clone(),
            status: RuntimeState::Stopped,
            timestamp: Utc::now(),
        };
        if !self
            .broker
            .publish_message(UNREGISTRATION_SUBJECT, &unregistration)
            .await
        {
            warn!("Unregistration could not be published");
        }
    }

    pub fn process_metrics(&self) -> ProcessMetrics {
        let (memory_usage_mb, cpu_usage_percent) = lock(&self.sampler).sample();
        ProcessMetrics {
            memory_usage_mb,
            cpu_usage_percent,
            active_task_count: self.registry.active_count(),
            uptime_seconds: self.uptime().as_secs(),
        }
    }

    pub fn status_reply(&self) -> StatusReply {
        let active_tasks = self.registry.active_ids();
        StatusReply {
            agent_id: self.identity.agent_id.clone(),
            status: self.state(),
            timestamp: Utc::now(),
            active_task_count: active_tasks.len(),
            active_tasks,
            metrics: self.process_metrics(),
        }
    }

    /// Terminal result of a finished task, if still cached
    pub fn task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.registry.result(task_id)
    }

    pub fn is_task_active(&self, task_id: &str) -> bool {
        self.registry.get(task_id).is_some()
    }
}

impl<T: Transport, E: TaskExecutor> HealthSource for AgentRuntime<T, E> {
    fn health_report(&self) -> HealthReport {
        let metrics = self.process_metrics();
        HealthReport {
            agent_id: self.identity.agent_id.clone(),
            status: self.state(),
            timestamp: Utc::now(),
            active_tasks: metrics.active_task_count,
            metrics,
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockExecutor, MockBehavior};
    use crate::transport::{MemoryBus, MemoryTransport};
    use serde_json::json;

    fn runtime(bus: &MemoryBus, executor: MockExecutor) -> Arc<AgentRuntime<MemoryTransport, MockExecutor>> {
        AgentRuntime::new(
            AgentIdentity::new("bridge-1", "python-bridge", ["code-generation"], "0.1.0"),
            RuntimeSettings {
                retry: RetryPolicy::immediate(1),
                health_interval: Duration::from_secs(3600),
                ..Default::default()
            },
            BrokerConnection::new(bus.transport()),
            executor,
        )
    }

    #[test]
    fn test_identity_supports() {
        let identity = AgentIdentity::new("a", "t", ["x", "y"], "1");
        assert!(identity.supports("x"));
        assert!(!identity.supports("z"));
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("kaboom".to_string())), "kaboom");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic");
    }

    #[tokio::test]
    async fn test_start_and_stop_transitions() {
        let bus = MemoryBus::new();
        let runtime = runtime(&bus, MockExecutor::new());
        assert_eq!(runtime.state(), RuntimeState::Initializing);

        runtime.start().await.unwrap();
        assert_eq!(runtime.state(), RuntimeState::Ready);
        // second start is a no-op
        runtime.start().await.unwrap();
        assert_eq!(bus.published_on(REGISTRATION_SUBJECT).len(), 1);

        runtime.stop().await;
        assert_eq!(runtime.state(), RuntimeState::Stopped);
        runtime.stop().await;
        assert_eq!(bus.published_on(UNREGISTRATION_SUBJECT).len(), 1);
    }

    #[tokio::test]
    async fn test_executor_init_failure_is_fatal() {
        let bus = MemoryBus::new();
        let runtime = runtime(&bus, MockExecutor::new().failing_initialize());

        let result = runtime.start().await;
        assert!(matches!(result, Err(RuntimeError::Executor(_))));
        assert_eq!(runtime.state(), RuntimeState::Error);
        assert!(!runtime.broker().is_connected());
        assert!(bus.published_on(REGISTRATION_SUBJECT).is_empty());
    }

    #[tokio::test]
    async fn test_processing_is_derived_from_active_tasks() {
        let bus = MemoryBus::new();
        let executor = MockExecutor::new().with_behavior(MockBehavior::Delay(Duration::from_millis(200)));
        let runtime = runtime(&bus, executor);
        runtime.start().await.unwrap();

        let intake = runtime
            .submit_task(TaskMessage {
                task_id: Some("t1".to_string()),
                task_type: Some("code-generation".to_string()),
                parameters: json!({}).as_object().cloned().unwrap_or_default(),
                malformed: None,
            })
            .await;
        assert_eq!(intake, Intake::Accepted);
        assert_eq!(runtime.state(), RuntimeState::Processing);
        assert_eq!(*runtime.state_receiver().borrow(), RuntimeState::Ready);

        bus.wait_for_messages("task.t1.result", 1, Duration::from_secs(2))
            .await
            .expect("result should be published");
        assert!(runtime.registry().wait_idle(Duration::from_secs(1)).await);
        assert_eq!(runtime.state(), RuntimeState::Ready);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_failed_status_reply_keeps_state() {
        let bus = MemoryBus::new();
        let runtime = runtime(&bus, MockExecutor::new());
        runtime.start().await.unwrap();

        // wildcard reply subject cannot be published to
        runtime
            .handle_control(ControlMessage {
                command: "status".to_string(),
                reply_to: Some("orchestrator.*".to_string()),
            })
            .await;
        assert_eq!(runtime.state(), RuntimeState::Ready);
        runtime.stop().await;
    }
}

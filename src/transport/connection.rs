//! Broker connection lifecycle
//!
//! [`BrokerConnection`] wraps a [`Transport`] with retry-on-connect,
//! connection state tracking, subscription bookkeeping and a dispatcher task
//! that routes inbound messages to subscription handlers.

use super::retry::{RetryDecision, RetryPolicy};
use super::{InboundMessage, Transport, TransportEvent};
use crate::observability::metrics::MetricsCollector;
use crate::protocol::{validate_subject, CodecError, MessageCodec, ValidationError};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection state, owned by [`BrokerConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(label)
    }
}

/// Broker-level errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed after {attempts} attempt(s): {last_error}")]
    ConnectExhausted { attempts: u32, last_error: String },
    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),
    #[error("Invalid subject: {0}")]
    InvalidSubject(#[from] ValidationError),
    #[error("Invalid queue group: '{0}'")]
    InvalidQueueGroup(String),
    #[error("Encoding failed: {0}")]
    Codec(#[from] CodecError),
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl BrokerError {
    fn transport<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        BrokerError::Transport(Box::new(error))
    }
}

/// Opaque handle returned by [`BrokerConnection::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

struct Subscription {
    subject: String,
    queue_group: Option<String>,
    handler: mpsc::UnboundedSender<InboundMessage>,
}

type SubscriptionTable = Arc<Mutex<HashMap<SubscriptionHandle, Subscription>>>;

/// Connection to the message bus with bounded-retry connect
pub struct BrokerConnection<T: Transport> {
    transport: Arc<T>,
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: SubscriptionTable,
    next_handle: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
    metrics: Arc<MetricsCollector>,
}

impl<T: Transport> BrokerConnection<T> {
    pub fn new(transport: T) -> Self {
        Self::with_metrics(transport, Arc::new(MetricsCollector::new()))
    }

    pub fn with_metrics(transport: T, metrics: Arc<MetricsCollector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport: Arc::new(transport),
            state_tx,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_handle: AtomicU64::new(1),
            dispatcher: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection state transitions
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect, retrying with backoff until `policy.max_attempts` attempts
    /// have been made. Returns immediately when already connected.
    pub async fn connect(&self, url: &str, policy: &RetryPolicy) -> Result<(), BrokerError> {
        let _guard = self.lifecycle.lock().await;
        policy.validate().map_err(BrokerError::InvalidRetryPolicy)?;

        if self.is_connected() {
            debug!(target: "bus_transport", "connect() called while already connected");
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut attempt = 1u32;

        loop {
            self.metrics.connection_attempt();
            info!(
                url = %url,
                attempt,
                max_attempts = policy.max_attempts,
                "Connecting to message bus"
            );

            match self.transport.connect(url, events_tx.clone()).await {
                Ok(()) => {
                    self.metrics.connection_established();
                    self.set_state(ConnectionState::Connected);
                    self.spawn_dispatcher(events_rx);
                    info!(url = %url, attempt, "Connected to message bus");
                    return Ok(());
                }
                Err(e) => {
                    self.metrics.connection_failed();
                    warn!(
                        url = %url,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Connection attempt failed"
                    );

                    match policy.decide(attempt) {
                        RetryDecision::Retry {
                            attempt: next,
                            delay,
                        } => {
                            debug!(
                                target: "bus_transport",
                                "Retrying in {}ms (attempt {}/{})",
                                delay.as_millis(),
                                next,
                                policy.max_attempts
                            );
                            tokio::time::sleep(delay).await;
                            attempt = next;
                        }
                        RetryDecision::GiveUp => {
                            self.set_state(ConnectionState::Disconnected);
                            error!(
                                url = %url,
                                attempts = attempt,
                                "Giving up on message bus connection"
                            );
                            return Err(BrokerError::ConnectExhausted {
                                attempts: attempt,
                                last_error: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Publish a payload. Returns `false` when the message was not handed to
    /// the bus; the cause is logged.
    pub async fn publish(&self, subject: &str, payload: Bytes) -> bool {
        match self.try_publish(subject, payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(subject = %subject, error = %e, "Publish failed");
                false
            }
        }
    }

    /// Encode a wire record and publish it, with the same contract as
    /// [`publish`](Self::publish)
    pub async fn publish_message<M: Serialize>(&self, subject: &str, message: &M) -> bool {
        match MessageCodec::encode(message) {
            Ok(payload) => self.publish(subject, payload).await,
            Err(e) => {
                error!(subject = %subject, error = %e, "Failed to encode message");
                self.metrics.publish_failed();
                false
            }
        }
    }

    /// Publish and report the cause of failure
    pub async fn try_publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        let result = self.publish_inner(subject, payload).await;
        match result {
            Ok(()) => self.metrics.message_published(),
            Err(_) => self.metrics.publish_failed(),
        }
        result
    }

    async fn publish_inner(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        validate_subject(subject)?;
        self.transport
            .publish(subject, payload)
            .await
            .map_err(BrokerError::transport)?;
        debug!(target: "bus_transport", "Published to {}", subject);
        Ok(())
    }

    /// Register `handler` for messages on `subject`. With a queue group, the
    /// bus load-balances each message to one member of the group.
    pub async fn subscribe(
        &self,
        subject: &str,
        handler: mpsc::UnboundedSender<InboundMessage>,
        queue_group: Option<&str>,
    ) -> Result<SubscriptionHandle, BrokerError> {
        self.ensure_connected()?;
        validate_subject(subject)?;
        if let Some(group) = queue_group {
            validate_queue_group(group)?;
        }

        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        lock_table(&self.subscriptions).insert(
            handle,
            Subscription {
                subject: subject.to_string(),
                queue_group: queue_group.map(str::to_string),
                handler,
            },
        );

        if let Err(e) = self
            .transport
            .subscribe(handle.0, subject, queue_group)
            .await
        {
            lock_table(&self.subscriptions).remove(&handle);
            return Err(BrokerError::transport(e));
        }

        info!(
            subject = %subject,
            queue_group = queue_group.unwrap_or("-"),
            subscription = handle.0,
            "Subscribed"
        );
        Ok(handle)
    }

    /// Remove a subscription. Unknown handles are ignored.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BrokerError> {
        let removed = lock_table(&self.subscriptions).remove(&handle);
        let Some(subscription) = removed else {
            debug!(target: "bus_transport", "Unsubscribe for unknown handle {}", handle.0);
            return Ok(());
        };

        if self.is_connected() {
            self.transport
                .unsubscribe(
                    handle.0,
                    &subscription.subject,
                    subscription.queue_group.as_deref(),
                )
                .await
                .map_err(BrokerError::transport)?;
        }

        info!(subject = %subscription.subject, subscription = handle.0, "Unsubscribed");
        Ok(())
    }

    pub fn subscription_count(&self) -> usize {
        lock_table(&self.subscriptions).len()
    }

    /// Close the connection and drop every subscription. Safe to call any
    /// number of times.
    pub async fn close(&self) {
        let _guard = self.lifecycle.lock().await;

        let dropped = {
            let mut table = lock_table(&self.subscriptions);
            let count = table.len();
            table.clear();
            count
        };

        let dispatcher = self.dispatcher_handle();
        if self.state() == ConnectionState::Disconnected && dispatcher.is_none() {
            debug!(target: "bus_transport", "close() on a closed connection");
            return;
        }

        self.set_state(ConnectionState::Closing);

        if let Some(handle) = dispatcher {
            handle.abort();
        }

        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Transport reported an error while closing");
        }

        self.set_state(ConnectionState::Disconnected);
        info!(dropped_subscriptions = dropped, "Message bus connection closed");
    }

    fn dispatcher_handle(&self) -> Option<JoinHandle<()>> {
        match self.dispatcher.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(BrokerError::NotConnected { state });
        }
        Ok(())
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(target: "bus_transport", "Connection state {} -> {}", previous, next);
        }
    }

    fn spawn_dispatcher(&self, events: mpsc::UnboundedReceiver<TransportEvent>) {
        let dispatcher = Dispatcher {
            transport: self.transport.clone(),
            state_tx: self.state_tx.clone(),
            subscriptions: self.subscriptions.clone(),
            metrics: self.metrics.clone(),
        };
        let handle = tokio::spawn(dispatcher.run(events));

        let previous = match self.dispatcher.lock() {
            Ok(mut slot) => slot.replace(handle),
            Err(poisoned) => poisoned.into_inner().replace(handle),
        };
        if let Some(stale) = previous {
            stale.abort();
        }
    }
}

impl<T: Transport> Drop for BrokerConnection<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher_handle() {
            handle.abort();
        }
    }
}

/// Background consumer of transport session events
struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: SubscriptionTable,
    metrics: Arc<MetricsCollector>,
}

impl<T: Transport> Dispatcher<T> {
    async fn run(self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(message) => self.deliver(message),
                TransportEvent::Disconnected(reason) => self.on_disconnected(&reason),
                TransportEvent::Reconnected => self.on_reconnected().await,
                TransportEvent::Error(reason) => {
                    error!(error = %reason, "Message bus reported an error");
                }
                TransportEvent::Closed => {
                    self.on_closed();
                    break;
                }
            }
        }
        debug!(target: "bus_transport", "Event dispatcher stopped");
    }

    fn deliver(&self, message: InboundMessage) {
        self.metrics.message_received();
        let mut table = lock_table(&self.subscriptions);

        let targets: Vec<SubscriptionHandle> = table
            .iter()
            .filter(|(handle, sub)| {
                if message.subscription_ids.is_empty() {
                    sub.subject == message.subject
                } else {
                    message.subscription_ids.contains(&handle.0)
                }
            })
            .map(|(handle, _)| *handle)
            .collect();

        if targets.is_empty() {
            debug!(target: "bus_transport", "No subscription for message on {}", message.subject);
            return;
        }

        for handle in targets {
            let closed = table
                .get(&handle)
                .map(|sub| sub.handler.send(message.clone()).is_err())
                .unwrap_or(false);
            if closed {
                debug!(target: "bus_transport", "Handler for subscription {} is gone", handle.0);
                table.remove(&handle);
            }
        }
    }

    fn on_disconnected(&self, reason: &str) {
        if *self.state_tx.borrow() == ConnectionState::Closing {
            return;
        }
        self.metrics.connection_lost();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        warn!(reason = %reason, "Message bus connection lost");
    }

    async fn on_reconnected(&self) {
        if *self.state_tx.borrow() == ConnectionState::Closing {
            return;
        }
        self.metrics.connection_established();
        self.state_tx.send_replace(ConnectionState::Connected);
        info!("Message bus connection restored");

        let live: Vec<(u64, String, Option<String>)> = lock_table(&self.subscriptions)
            .iter()
            .map(|(handle, sub)| (handle.0, sub.subject.clone(), sub.queue_group.clone()))
            .collect();

        for (sid, subject, group) in live {
            match self.transport.subscribe(sid, &subject, group.as_deref()).await {
                Ok(()) => debug!(target: "bus_transport", "Re-subscribed to {}", subject),
                Err(e) => error!(subject = %subject, error = %e, "Failed to re-subscribe"),
            }
        }
    }

    fn on_closed(&self) {
        if *self.state_tx.borrow() == ConnectionState::Closing {
            return;
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("Message bus session closed by transport");
    }
}

fn validate_queue_group(group: &str) -> Result<(), BrokerError> {
    let valid = !group.is_empty()
        && group
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(BrokerError::InvalidQueueGroup(group.to_string()))
    }
}

fn lock_table(
    table: &SubscriptionTable,
) -> std::sync::MutexGuard<'_, HashMap<SubscriptionHandle, Subscription>> {
    match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryBus;
    use std::time::Duration;

    fn connection(bus: &MemoryBus) -> BrokerConnection<crate::transport::MemoryTransport> {
        BrokerConnection::new(bus.transport())
    }

    #[tokio::test]
    async fn test_publish_before_connect_returns_false() {
        let bus = MemoryBus::new();
        let conn = connection(&bus);

        assert!(!conn.publish("agent.health", Bytes::from_static(b"{}")).await);
        assert!(matches!(
            conn.try_publish("agent.health", Bytes::new()).await,
            Err(BrokerError::NotConnected {
                state: ConnectionState::Disconnected
            })
        ));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let bus = MemoryBus::new();
        let conn = connection(&bus);
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = conn.subscribe("agent.a.task", tx, None).await;
        assert!(matches!(result, Err(BrokerError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_exactly_max_attempts() {
        let bus = MemoryBus::new();
        bus.set_reachable(false);
        let conn = connection(&bus);

        let result = conn
            .connect("memory://local", &RetryPolicy::immediate(4))
            .await;

        assert!(matches!(
            result,
            Err(BrokerError::ConnectExhausted { attempts: 4, .. })
        ));
        assert_eq!(bus.connect_attempts(), 4);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.metrics().snapshot().bus.connection_attempts, 4);
    }

    #[tokio::test]
    async fn test_invalid_subject_is_rejected() {
        let bus = MemoryBus::new();
        let conn = connection(&bus);
        conn.connect("memory://local", &RetryPolicy::immediate(1))
            .await
            .unwrap();

        assert!(!conn.publish("agent.*.task", Bytes::new()).await);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            conn.subscribe("agent.a.task", tx, Some("bad group")).await,
            Err(BrokerError::InvalidQueueGroup(_))
        ));
    }

    #[tokio::test]
    async fn test_messages_reach_handler_in_order() {
        let bus = MemoryBus::new();
        let conn = connection(&bus);
        conn.connect("memory://local", &RetryPolicy::immediate(1))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe("agent.a.task", tx, None).await.unwrap();

        for n in 0..5 {
            bus.inject("agent.a.task", Bytes::from(format!("{n}")));
        }

        for n in 0..5 {
            let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message.payload, Bytes::from(format!("{n}")));
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = MemoryBus::new();
        let conn = connection(&bus);
        conn.connect("memory://local", &RetryPolicy::immediate(1))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = conn.subscribe("agent.a.control", tx, None).await.unwrap();
        conn.unsubscribe(handle).await.unwrap();
        // second call is a no-op
        conn.unsubscribe(handle).await.unwrap();

        assert_eq!(bus.inject("agent.a.control", Bytes::new()), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_clears_subscriptions() {
        let bus = MemoryBus::new();
        let conn = connection(&bus);
        conn.connect("memory://local", &RetryPolicy::immediate(1))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe("agent.a.task", tx, None).await.unwrap();
        assert_eq!(conn.subscription_count(), 1);

        conn.close().await;
        conn.close().await;

        assert_eq!(conn.subscription_count(), 0);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        // handler sender dropped with the subscription table
        assert!(rx.recv().await.is_none());
        assert!(!conn.publish("agent.health", Bytes::new()).await);
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect_update_state_and_resubscribe() {
        let bus = MemoryBus::new();
        let conn = connection(&bus);
        conn.connect("memory://local", &RetryPolicy::immediate(1))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe("agent.a.task", tx, None).await.unwrap();

        let mut state = conn.state_receiver();
        bus.interrupt();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(!conn.publish("agent.health", Bytes::new()).await);

        bus.resume();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        // re-subscription happens right after the state flips
        let delivered = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if bus.inject("agent.a.task", Bytes::from_static(b"x")) > 0 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(delivered.is_ok());
        assert!(rx.recv().await.is_some());
    }
}

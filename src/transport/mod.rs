//! Message bus transport
//!
//! [`BrokerConnection`] owns the connection lifecycle: retry with backoff,
//! connection state, subscription bookkeeping and dispatch of inbound
//! messages to subscription handlers. The physical link underneath is a
//! [`Transport`] implementation:
//!
//! - [`mqtt::MqttTransport`] speaks MQTT v5 through rumqttc, mapping queue
//!   groups onto shared subscriptions
//! - [`memory::MemoryTransport`] attaches to an in-process [`memory::MemoryBus`]

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub mod connection;
pub mod memory;
pub mod mqtt;
pub mod retry;

pub use connection::{BrokerConnection, BrokerError, ConnectionState, SubscriptionHandle};
pub use memory::{MemoryBus, MemoryTransport};
pub use mqtt::MqttTransport;
pub use retry::{RetryDecision, RetryPolicy};

/// Message received from the bus
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Identifiers of the local subscriptions this delivery matched, when
    /// the transport reports them
    pub subscription_ids: Vec<u64>,
}

/// Session events emitted by a transport after a successful connect
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Inbound message on a subscribed subject
    Message(InboundMessage),
    /// The link dropped; the transport keeps trying to restore it
    Disconnected(String),
    /// The link was restored; subscriptions must be re-established
    Reconnected,
    /// Non-fatal protocol or broker error
    Error(String),
    /// The session ended and no further events follow
    Closed,
}

/// Physical link to a message bus
///
/// Implementations make exactly one connection attempt per `connect` call;
/// retry policy belongs to [`BrokerConnection`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Attempt a single connection. On success every session event is sent
    /// to `events` until the session is closed.
    async fn connect(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), Self::Error>;

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), Self::Error>;

    /// Subscribe under the caller-chosen identifier `sid`. With a queue group,
    /// deliveries are load-balanced across all members of that group.
    async fn subscribe(
        &self,
        sid: u64,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<(), Self::Error>;

    async fn unsubscribe(
        &self,
        sid: u64,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<(), Self::Error>;

    /// End the session. Must succeed when no session is open.
    async fn close(&self) -> Result<(), Self::Error>;
}

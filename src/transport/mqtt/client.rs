//! Impure I/O for the MQTT transport
//!
//! Owns the rumqttc client and its event loop task. Everything that inspects
//! packets or builds options lives in the pure sibling modules.

use super::events::{EventRoute, MessageHandler};
use super::options::{configure_mqtt_options, subscription_filter, MqttCredentials, MqttError};
use crate::transport::{Transport, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::SubscribeProperties;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a connection attempt waits for ConnAck
pub const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between event loop polls while the link is down. rumqttc
/// reconnects on the next poll after an error.
pub const REPOLL_PAUSE: Duration = Duration::from_secs(1);
const REQUEST_CHANNEL_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct MqttSession {
    client: AsyncClient,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// MQTT v5 implementation of [`Transport`]
pub struct MqttTransport {
    agent_id: String,
    credentials: Option<MqttCredentials>,
    session: Mutex<Option<MqttSession>>,
}

impl MqttTransport {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            credentials: None,
            session: Mutex::new(None),
        }
    }

    pub fn with_credentials(mut self, credentials: Option<MqttCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Wait for the event loop to report the first ConnAck
    async fn wait_for_connection_confirmation(
        ack_rx: oneshot::Receiver<Result<(), String>>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(MqttError::ConnectionFailed(reason)),
            Ok(Err(_)) => Err(MqttError::ConnectionFailed(
                "event loop stopped before ConnAck".to_string(),
            )),
            Err(_) => Err(MqttError::ConnAckTimeout(timeout)),
        }
    }

    async fn shutdown_session(session: MqttSession) {
        if let Err(e) = session.client.disconnect().await {
            debug!(target: "mqtt_transport", "Disconnect request not sent: {}", e);
        }
        let _ = session.shutdown_tx.send(true);

        let mut handle = session.handle;
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => debug!(target: "mqtt_transport", "Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Event loop task didn't shut down gracefully, forcing abort");
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    type Error = MqttError;

    async fn connect(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), Self::Error> {
        let mut session = self.session.lock().await;
        if let Some(stale) = session.take() {
            Self::shutdown_session(stale).await;
        }

        let options = configure_mqtt_options(&self.agent_id, url, self.credentials.as_ref())?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ack_tx, ack_rx) = oneshot::channel();

        let handle = tokio::spawn(run_event_loop(
            self.agent_id.clone(),
            event_loop,
            events,
            shutdown_rx,
            ack_tx,
        ));

        match Self::wait_for_connection_confirmation(ack_rx, CONNACK_TIMEOUT).await {
            Ok(()) => {
                *session = Some(MqttSession {
                    client,
                    shutdown_tx,
                    handle,
                });
                Ok(())
            }
            Err(e) => {
                let _ = shutdown_tx.send(true);
                handle.abort();
                Err(e)
            }
        }
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), Self::Error> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(MqttError::NotConnected)?;
        session
            .client
            .publish(subject, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        sid: u64,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<(), Self::Error> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(MqttError::NotConnected)?;

        // The identifier comes back on every matching publish, which is how
        // deliveries are routed to the right local handler
        let properties = SubscribeProperties {
            id: Some(sid as usize),
            user_properties: Vec::new(),
        };
        let filter = subscription_filter(subject, queue_group);
        session
            .client
            .subscribe_with_properties(filter.clone(), QoS::AtLeastOnce, properties)
            .await?;

        debug!(target: "mqtt_transport", "Subscribe request sent for {} (id {})", filter, sid);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        _sid: u64,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<(), Self::Error> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(MqttError::NotConnected)?;
        session
            .client
            .unsubscribe(subscription_filter(subject, queue_group))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            Self::shutdown_session(session).await;
            info!(agent_id = %self.agent_id, "MQTT session closed");
        }
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            let _ = session.shutdown_tx.send(true);
            session.handle.abort();
        }
    }
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn run_event_loop(
    agent_id: String,
    mut event_loop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    ack_tx: oneshot::Sender<Result<(), String>>,
) {
    info!("Starting MQTT event loop for agent: {}", agent_id);
    let mut pending_ack = Some(ack_tx);
    let mut link_up = false;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(target: "mqtt_transport", "Shutdown signal received");
                    break;
                }
            }

            polled = event_loop.poll() => match polled {
                Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged => {
                        if let Some(ack) = pending_ack.take() {
                            let _ = ack.send(Ok(()));
                        } else if !link_up {
                            let _ = events.send(TransportEvent::Reconnected);
                        }
                        link_up = true;
                    }
                    EventRoute::MessageReceived(message) => {
                        debug!(target: "mqtt_transport", "Received message on {}", message.subject);
                        let _ = events.send(TransportEvent::Message(message));
                    }
                    EventRoute::Disconnected(reason) => {
                        if link_up {
                            link_up = false;
                            let _ = events.send(TransportEvent::Disconnected(reason));
                        }
                    }
                    EventRoute::SubscriptionRejected { packet_id, reasons } => {
                        let _ = events.send(TransportEvent::Error(format!(
                            "subscription {packet_id} rejected: {}",
                            reasons.join(", ")
                        )));
                    }
                    EventRoute::InfrastructureEvent(description) => {
                        debug!(target: "mqtt_transport", "MQTT event: {}", description);
                    }
                    EventRoute::OutgoingEvent => {}
                },
                Err(e) => {
                    if let Some(ack) = pending_ack.take() {
                        // The connection attempt failed; the caller decides on retries
                        let _ = ack.send(Err(e.to_string()));
                        return;
                    }
                    if link_up {
                        link_up = false;
                        error!("MQTT event loop error for agent {}: {}", agent_id, e);
                        let _ = events.send(TransportEvent::Disconnected(e.to_string()));
                    } else {
                        debug!(target: "mqtt_transport", "Reconnect attempt failed: {}", e);
                    }
                    if !interruptible_sleep(shutdown_rx.clone(), REPOLL_PAUSE).await {
                        break;
                    }
                }
            }
        }
    }

    if pending_ack.is_none() {
        let _ = events.send(TransportEvent::Closed);
    }
    info!("MQTT event loop stopped for agent: {}", agent_id);
}

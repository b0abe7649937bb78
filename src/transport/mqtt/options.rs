//! Pure MQTT session configuration
//!
//! Builds rumqttc options from a broker URL and maps queue groups onto MQTT v5
//! shared subscriptions.

use crate::protocol::{MessageCodec, RuntimeState, Unregistration, UNREGISTRATION_SUBJECT};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Keep-alive interval negotiated with the broker
pub const KEEP_ALIVE: Duration = Duration::from_secs(60);
/// Largest packet accepted in either direction
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("No ConnAck received within {0:?}")]
    ConnAckTimeout(Duration),
    #[error("No open MQTT session")]
    NotConnected,
    #[error("MQTT client request failed")]
    Client(#[from] rumqttc::v5::ClientError),
    #[error("Failed to encode last-will payload")]
    Serialization(#[source] crate::protocol::CodecError),
}

/// Broker credentials resolved from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttCredentials {
    pub username: String,
    pub password: String,
}

/// Build options for one connection attempt.
///
/// Accepts `mqtt://`, `tcp://` and `mqtts://` URLs; the latter enables TLS.
/// Every attempt gets a fresh client id so a half-open session on the broker
/// cannot block the new one.
pub fn configure_mqtt_options(
    agent_id: &str,
    broker_url: &str,
    credentials: Option<&MqttCredentials>,
) -> Result<MqttOptions, MqttError> {
    let url =
        Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

    let secure = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(MqttError::InvalidBrokerUrl(broker_url.to_string())),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(if secure { 8883 } else { 1883 });

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let client_id = format!("{agent_id}-{}", &suffix[..8]);
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if secure {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    mqtt_options.set_keep_alive(KEEP_ALIVE);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    // The broker announces our departure if the link dies without a clean stop
    let farewell = Unregistration {
        agent_id: agent_id.to_string(),
        status: RuntimeState::Stopped,
        timestamp: chrono::Utc::now(),
    };
    let payload = MessageCodec::encode(&farewell).map_err(MqttError::Serialization)?;
    let lwt = LastWill::new(UNREGISTRATION_SUBJECT, payload, QoS::AtLeastOnce, false, None);
    mqtt_options.set_last_will(lwt);

    Ok(mqtt_options)
}

/// Topic filter for a subscription. Queue-group members share the
/// `$share/<group>/<subject>` filter, so the broker delivers each message to
/// one of them.
pub fn subscription_filter(subject: &str, queue_group: Option<&str>) -> String {
    match queue_group {
        Some(group) => format!("$share/{group}/{subject}"),
        None => subject.to_string(),
    }
}

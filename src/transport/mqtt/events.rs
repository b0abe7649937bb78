//! Pure routing of rumqttc events
//!
//! The event loop in [`super::client`] only acts on an [`EventRoute`], which
//! keeps packet inspection testable without a broker.

use crate::transport::InboundMessage;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::Event;

/// Routing decision for one event loop event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Session established or re-established
    ConnectionAcknowledged,
    /// Application message on a subscribed topic
    MessageReceived(InboundMessage),
    /// Broker closed the session
    Disconnected(String),
    /// Broker refused one or more filters of a subscribe request
    SubscriptionRejected { packet_id: u16, reasons: Vec<String> },
    /// Keep-alive and acknowledgement traffic
    InfrastructureEvent(String),
    /// Outgoing packet
    OutgoingEvent,
}

pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    subject: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    subscription_ids: publish
                        .properties
                        .as_ref()
                        .map(|p| p.subscription_identifiers.iter().map(|id| *id as u64).collect())
                        .unwrap_or_default(),
                }),
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
                }
                Packet::SubAck(suback) => {
                    let reasons: Vec<String> = suback
                        .return_codes
                        .iter()
                        .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                        .map(|code| format!("{code:?}"))
                        .collect();
                    if reasons.is_empty() {
                        EventRoute::InfrastructureEvent(format!("SubAck({})", suback.pkid))
                    } else {
                        EventRoute::SubscriptionRejected {
                            packet_id: suback.pkid,
                            reasons,
                        }
                    }
                }
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

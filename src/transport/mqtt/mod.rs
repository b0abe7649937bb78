//! MQTT v5 transport
//!
//! Separates pure functions from I/O:
//!
//! - [`options`] - option building, credentials and shared-subscription filters
//! - [`events`] - routing of rumqttc events
//! - [`client`] - the event loop task and the [`Transport`](crate::transport::Transport) impl
//!
//! Subjects are used verbatim as topic names. Queue groups become MQTT v5
//! shared subscriptions (`$share/<group>/<subject>`), and each subscription
//! carries its handle as a subscription identifier so inbound publishes can
//! be routed without topic matching.

pub mod client;
pub mod events;
pub mod options;

pub use client::MqttTransport;
pub use events::{EventRoute, MessageHandler};
pub use options::{configure_mqtt_options, subscription_filter, MqttCredentials, MqttError};

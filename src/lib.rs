//! bridge-agent
//!
//! A worker agent that joins a publish/subscribe message bus, announces the
//! task types it can handle, runs tasks concurrently through a pluggable
//! backend and reports health on a fixed interval.
//!
//! # Overview
//!
//! - [`transport`]: the bus connection with bounded retry, queue groups and
//!   resubscription, over MQTT v5 or an in-process bus
//! - [`protocol`]: wire records, subjects and the JSON codec
//! - [`agent`]: the runtime state machine, task registry and executors
//! - [`health`]: periodic heartbeats
//! - [`observability`]: logging, metrics and the HTTP facade
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use bridge_agent::agent::{AgentIdentity, AgentRuntime, EchoExecutor, RuntimeSettings};
//! use bridge_agent::transport::{BrokerConnection, MqttTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = AgentIdentity::new(
//!     "bridge-agent-1",
//!     "python-bridge",
//!     ["code-generation", "documentation-generation"],
//!     "0.1.0",
//! );
//! let settings = RuntimeSettings {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     ..Default::default()
//! };
//! let broker = BrokerConnection::new(MqttTransport::new("bridge-agent-1"));
//!
//! let runtime = AgentRuntime::new(identity, settings, broker, EchoExecutor);
//! runtime.start().await?;
//! // ... tasks arrive on agent.bridge-agent-1.task ...
//! runtime.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod health;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use agent::{AgentIdentity, AgentRuntime, RuntimeSettings, TaskExecutor};
pub use config::{AgentConfig, ConfigError};
pub use error::{AgentError, AgentResult};
pub use protocol::*;

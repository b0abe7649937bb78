//! Configuration for the bridge agent
//!
//! One TOML file, every section optional except where noted. Values are
//! validated after parsing; credentials are read from the environment
//! variables the file names, never from the file itself.

use crate::agent::{AgentIdentity, HttpExecutorConfig, RuntimeSettings};
use crate::protocol::validate_agent_id;
use crate::transport::mqtt::MqttCredentials;
use crate::transport::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// URL schemes accepted for `broker.url`
pub const SUPPORTED_SCHEMES: &[&str] = &["mqtt", "tcp", "mqtts", "ssl", "memory"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentConfig {
    /// Default log level when `LOG_LEVEL` is unset
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub api: ApiSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// Agent identifier (must match [a-zA-Z0-9._-]+). Generated when empty.
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Task types this agent accepts
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: String::new(),
            agent_type: default_agent_type(),
            version: default_version(),
            capabilities: default_capabilities(),
        }
    }
}

fn default_agent_type() -> String {
    "python-bridge".to_string()
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_capabilities() -> Vec<String> {
    ["code-generation", "documentation-generation", "uvc-analysis"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Environment variable holding the broker username
    pub username_env: Option<String>,
    /// Environment variable holding the broker password
    pub password_env: Option<String>,
    /// Queue group for the task subscription
    pub queue_group: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            username_env: None,
            password_env: None,
            queue_group: None,
            retry: RetryPolicy::default(),
        }
    }
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Whether `GET /metrics` is served
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            metrics_enabled: true,
        }
    }
}

fn default_check_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSection {
    /// Upper bound on concurrently active tasks; unbounded when absent
    pub max_in_flight: Option<usize>,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            max_in_flight: None,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_shutdown_grace() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorSection {
    /// HTTP backend; tasks are echoed back when absent
    pub url: Option<String>,
    #[serde(default = "default_executor_timeout")]
    pub timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_executor_timeout(),
        }
    }
}

fn default_executor_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid agent ID format: {0}")]
    InvalidAgentId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load, fill in a generated agent id if needed, and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: AgentConfig = toml::from_str(content)?;
        config.ensure_agent_id();
        config.validate()?;
        Ok(config)
    }

    /// Configuration with every default and a generated agent id
    pub fn with_defaults() -> Self {
        let mut config = Self::default();
        config.ensure_agent_id();
        config
    }

    fn ensure_agent_id(&mut self) {
        if self.agent.id.trim().is_empty() {
            self.agent.id = generate_agent_id();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_agent_id(&self.agent.id).map_err(|e| {
            ConfigError::InvalidAgentId(format!(
                "Agent ID '{}' must match pattern [a-zA-Z0-9._-]+ ({e})",
                self.agent.id
            ))
        })?;

        if self.agent.capabilities.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "agent.capabilities must list at least one task type".to_string(),
            ));
        }
        if let Some(blank) = self.agent.capabilities.iter().find(|c| c.trim().is_empty()) {
            return Err(ConfigError::InvalidConfig(format!(
                "agent.capabilities contains a blank entry: '{blank}'"
            )));
        }

        let url = Url::parse(&self.broker.url).map_err(|e| {
            ConfigError::InvalidConfig(format!("broker.url '{}': {e}", self.broker.url))
        })?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(ConfigError::InvalidConfig(format!(
                "broker.url scheme '{}' is not one of {}",
                url.scheme(),
                SUPPORTED_SCHEMES.join(", ")
            )));
        }

        self.broker
            .retry
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("broker.retry: {e}")))?;

        if self.health.check_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "health.check_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.runtime.max_in_flight == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "runtime.max_in_flight must be greater than 0 when set".to_string(),
            ));
        }

        if let Some(executor_url) = &self.executor.url {
            Url::parse(executor_url).map_err(|e| {
                ConfigError::InvalidConfig(format!("executor.url '{executor_url}': {e}"))
            })?;
        }

        if self.api.enabled {
            self.api_address()?;
        }

        Ok(())
    }

    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity::new(
            self.agent.id.clone(),
            self.agent.agent_type.clone(),
            self.agent.capabilities.iter().cloned(),
            self.agent.version.clone(),
        )
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            broker_url: self.broker.url.clone(),
            retry: self.broker.retry.clone(),
            queue_group: self.broker.queue_group.clone(),
            health_interval: Duration::from_secs(self.health.check_interval_secs),
            max_in_flight: self.runtime.max_in_flight,
            shutdown_grace: Duration::from_secs(self.runtime.shutdown_grace_secs),
        }
    }

    pub fn executor_config(&self) -> Option<HttpExecutorConfig> {
        self.executor.url.as_ref().map(|url| HttpExecutorConfig {
            url: url.clone(),
            timeout: Duration::from_secs(self.executor.timeout_secs),
        })
    }

    pub fn api_address(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.api.host.parse().map_err(|_| {
            ConfigError::InvalidConfig(format!("api.host '{}' is not an IP address", self.api.host))
        })?;
        Ok(SocketAddr::new(ip, self.api.port))
    }

    /// Broker credentials from the configured environment variables.
    /// Naming only one of the two variables is an error.
    pub fn broker_credentials(&self) -> Result<Option<MqttCredentials>, ConfigError> {
        match (&self.broker.username_env, &self.broker.password_env) {
            (None, None) => Ok(None),
            (Some(username_env), Some(password_env)) => Ok(Some(MqttCredentials {
                username: Self::get_env_var_required(username_env)?,
                password: Self::get_env_var_required(password_env)?,
            })),
            _ => Err(ConfigError::InvalidConfig(
                "broker.username_env and broker.password_env must be set together".to_string(),
            )),
        }
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[agent]
id = "test-agent"
capabilities = ["code-generation"]

[broker]
url = "memory://test"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// `bridge-agent-` followed by 8 hex characters
pub fn generate_agent_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    format!("bridge-agent-{}", &simple[..8])
}

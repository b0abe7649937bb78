//! Configuration loading and validation tests
//!
//! Tests focus on observable outcomes of loading a file: what the runtime
//! will be built with, and which files are refused.

use bridge_agent::config::{AgentConfig, ConfigError};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[agent]
id = "bridge-agent-1"
capabilities = ["code-generation", "documentation-generation"]

[broker]
url = "mqtt://localhost:1883"
queue_group = "bridge-agents"

[broker.retry]
max_attempts = 5
initial_delay_ms = 200
multiplier = 2.0
max_delay_ms = 2000
"#,
    );

    let config = AgentConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.agent.id, "bridge-agent-1");
    assert_eq!(
        config.agent.capabilities,
        vec!["code-generation", "documentation-generation"]
    );
    let settings = config.runtime_settings();
    assert_eq!(settings.broker_url, "mqtt://localhost:1883");
    assert_eq!(settings.queue_group.as_deref(), Some("bridge-agents"));
    assert_eq!(settings.retry.max_attempts, 5);
    assert_eq!(settings.retry.delay_after(1), Duration::from_millis(200));
    assert_eq!(settings.health_interval, Duration::from_secs(30));
}

#[test]
fn test_missing_id_is_generated() {
    let temp_file = write_config("[broker]\nurl = \"memory://local\"\n");
    let first = AgentConfig::load_from_file(temp_file.path()).unwrap();
    let second = AgentConfig::load_from_file(temp_file.path()).unwrap();

    assert!(first.agent.id.starts_with("bridge-agent-"));
    assert!(first.agent.id["bridge-agent-".len()..]
        .chars()
        .all(|c| c.is_ascii_hexdigit()));
    assert_ne!(first.agent.id, second.agent.id);
}

#[test]
fn test_missing_file_is_a_read_error() {
    let result = AgentConfig::load_from_file(Path::new("/nonexistent/bridge-agent.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let temp_file = write_config("[agent\nid = ");
    let result = AgentConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_values_are_rejected() {
    let cases = [
        "[agent]\nid = \"has space\"\n",
        "[agent]\ncapabilities = []\n",
        "[broker]\nurl = \"http://localhost\"\n",
        "[broker.retry]\nmultiplier = 0.5\n",
        "[broker.retry]\ninitial_delay_ms = 5000\nmax_delay_ms = 100\n",
        "[health]\ncheck_interval_secs = 0\n",
        "[runtime]\nmax_in_flight = 0\n",
        "[executor]\nurl = \"not a url\"\n",
        "[api]\nhost = \"localhost:80\"\n",
    ];

    for content in cases {
        let temp_file = write_config(content);
        let result = AgentConfig::load_from_file(temp_file.path());
        assert!(result.is_err(), "config should be rejected:\n{content}");
    }
}

#[test]
fn test_credentials_resolve_from_environment() {
    std::env::set_var("BRIDGE_TEST_BROKER_USER", "agent");
    std::env::set_var("BRIDGE_TEST_BROKER_PASS", "s3cret");
    let temp_file = write_config(
        r#"
[broker]
url = "mqtts://broker.example.com:8883"
username_env = "BRIDGE_TEST_BROKER_USER"
password_env = "BRIDGE_TEST_BROKER_PASS"
"#,
    );

    let config = AgentConfig::load_from_file(temp_file.path()).unwrap();
    let credentials = config.broker_credentials().unwrap().unwrap();
    assert_eq!(credentials.username, "agent");
    assert_eq!(credentials.password, "s3cret");
}

#[test]
fn test_executor_and_api_sections() {
    let temp_file = write_config(
        r#"
[executor]
url = "http://127.0.0.1:9000/process"
timeout_secs = 12

[api]
enabled = false
port = 0
"#,
    );

    let config = AgentConfig::load_from_file(temp_file.path()).unwrap();
    let executor = config.executor_config().unwrap();
    assert_eq!(executor.url, "http://127.0.0.1:9000/process");
    assert_eq!(executor.timeout, Duration::from_secs(12));
    assert!(!config.api.enabled);
}

#[test]
fn test_effective_config_round_trips_through_toml() {
    let config = AgentConfig::with_defaults();
    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = AgentConfig::from_toml_str(&rendered).unwrap();
    assert_eq!(reparsed, config);
}

//! Top-level error type and outbound message sanitizing
//!
//! Each layer has its own `thiserror` enum; [`AgentError`] gathers them for
//! the binary. Any error text that leaves the process inside a task result
//! goes through [`sanitize_error_message`] first.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Longest error message published in a task result
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

const TRUNCATED_SUFFIX: &str = "...[truncated]";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::agent::RuntimeError),

    #[error("Message bus error: {0}")]
    Broker(#[from] crate::transport::BrokerError),

    #[error("Transport error: {0}")]
    Mqtt(#[from] crate::transport::mqtt::MqttError),

    #[error("Executor error: {0}")]
    Executor(#[from] crate::agent::ExecutorError),

    #[error("Codec error: {0}")]
    Codec(#[from] crate::protocol::CodecError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AgentError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

/// Redact credentials and sensitive paths, then cap the length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").into_owned();
    }
    if let Some(pattern) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .into_owned();
    }

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN - TRUNCATED_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATED_SUFFIX);
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_are_redacted() {
        let sanitized =
            sanitize_error_message("Failed to authenticate: password=secret123 token=abc456");
        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_case_insensitive_and_colon_forms() {
        let sanitized = sanitize_error_message("PASSWORD: hunter2 Key=xyz");
        assert!(!sanitized.contains("hunter2"));
        assert!(!sanitized.contains("xyz"));
    }

    #[test]
    fn test_sensitive_paths_are_redacted() {
        let sanitized = sanitize_error_message("Failed to read /home/user/.aws/credentials");
        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains(".aws/credentials"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert_eq!(sanitized.len(), MAX_ERROR_MESSAGE_LEN);
        assert!(sanitized.ends_with(TRUNCATED_SUFFIX));

        let exact = sanitize_error_message(&"x".repeat(500));
        assert_eq!(exact.len(), 500);
        assert!(!exact.contains("truncated"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.len() <= MAX_ERROR_MESSAGE_LEN);
        assert!(sanitized.ends_with(TRUNCATED_SUFFIX));
    }

    #[test]
    fn test_plain_message_unchanged() {
        assert_eq!(
            sanitize_error_message("Unsupported task type: translate"),
            "Unsupported task type: translate"
        );
        assert_eq!(sanitize_error_message(""), "");
    }

    #[test]
    fn test_error_conversions() {
        let error: AgentError = crate::config::ConfigError::InvalidConfig("bad".into()).into();
        assert_eq!(
            error.to_string(),
            "Configuration error: Invalid configuration: bad"
        );
        assert_eq!(
            AgentError::internal("boom").to_string(),
            "Internal error: boom"
        );
    }
}

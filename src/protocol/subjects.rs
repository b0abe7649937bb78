//! Subject construction and validation
//!
//! Subjects are dot-separated tokens. The same strings are used as MQTT topic
//! names and as in-memory bus subjects, so wildcard characters of either
//! family are rejected.

use thiserror::Error;

/// Subject carrying registration announcements
pub const REGISTRATION_SUBJECT: &str = "agent.registration";
/// Subject carrying unregistration announcements
pub const UNREGISTRATION_SUBJECT: &str = "agent.unregistration";
/// Subject carrying heartbeats
pub const HEALTH_SUBJECT: &str = "agent.health";

const WILDCARDS: [char; 4] = ['*', '>', '+', '#'];

/// Builders for the per-agent and per-task subjects
pub struct SubjectBuilder;

impl SubjectBuilder {
    /// `agent.<agentId>.task`
    pub fn task(agent_id: &str) -> String {
        format!("agent.{agent_id}.task")
    }

    /// `agent.<agentId>.control`
    pub fn control(agent_id: &str) -> String {
        format!("agent.{agent_id}.control")
    }

    /// `agent.<agentId>.status`, the default reply subject for `status`
    pub fn status(agent_id: &str) -> String {
        format!("agent.{agent_id}.status")
    }

    /// `task.<taskId>.result`
    pub fn task_result(task_id: &str) -> String {
        format!("task.{task_id}.result")
    }
}

/// Check that a subject can be published to and subscribed on literally
pub fn validate_subject(subject: &str) -> Result<(), ValidationError> {
    if subject.is_empty() {
        return Err(ValidationError::EmptySubject);
    }

    if let Some(ch) = subject
        .chars()
        .find(|c| c.is_whitespace() || WILDCARDS.contains(c) || *c == '/')
    {
        return Err(ValidationError::InvalidSubjectChar {
            subject: subject.to_string(),
            ch,
        });
    }

    if subject.starts_with('$') {
        return Err(ValidationError::ReservedSubject(subject.to_string()));
    }

    if subject.split('.').any(str::is_empty) {
        return Err(ValidationError::EmptyToken(subject.to_string()));
    }

    Ok(())
}

pub fn validate_agent_id(agent_id: &str) -> Result<(), ValidationError> {
    if agent_id.is_empty() {
        return Err(ValidationError::EmptyAgentId);
    }

    for ch in agent_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidAgentIdChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for identifiers and subjects
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Agent ID cannot be empty")]
    EmptyAgentId,
    #[error("Agent ID contains invalid character: '{0}'")]
    InvalidAgentIdChar(char),
    #[error("Subject cannot be empty")]
    EmptySubject,
    #[error("Subject '{subject}' contains invalid character: '{ch}'")]
    InvalidSubjectChar { subject: String, ch: char },
    #[error("Subject '{0}' uses a reserved prefix")]
    ReservedSubject(String),
    #[error("Subject '{0}' contains an empty token")]
    EmptyToken(String),
}

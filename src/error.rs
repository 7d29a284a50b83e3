//! Error taxonomy for the agent
//!
//! [`AgentError`] covers startup and lifecycle failures. [`CommandError`]
//! covers a single inbound command; it never stops the dispatcher and is
//! converted into an [`ErrorPayload`] published on the response topic.

use crate::agent::LifecycleError;
use crate::auth::AuthError;
use crate::protocol::messages::{ErrorCode, ErrorPayload};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::config::ConfigError),

    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Transport error: {0}")]
    TransportError(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Lifecycle error: {0}")]
    LifecycleError(#[from] LifecycleError),

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl AgentError {
    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Wrap any transport failure
    pub fn transport<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::TransportError(Box::new(error))
    }
}

/// Failure reported by a command handler
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self::new(format!("I/O error: {e}"))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(format!("Serialization error: {e}"))
    }
}

/// Per-command failures handled by the dispatcher
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Malformed request payload: {message}")]
    Decode { message: String },

    #[error("Handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("Handler panicked: {message}")]
    HandlerPanicked { message: String },

    #[error("No binding for topic {topic}")]
    ProtocolViolation { topic: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CommandError {
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            CommandError::Decode { .. } => ErrorCode::DecodeError,
            CommandError::Handler(_) => ErrorCode::HandlerError,
            CommandError::HandlerPanicked { .. } => ErrorCode::HandlerPanicked,
            CommandError::ProtocolViolation { .. } | CommandError::Internal { .. } => {
                ErrorCode::InternalError
            }
        }
    }

    /// Convert to the structured payload published on the response topic
    pub fn to_error_payload(&self, id: Option<Value>) -> ErrorPayload {
        ErrorPayload::new(self.code(), sanitize_error_message(&self.to_string()), id)
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_ERROR_MESSAGE: usize = 500;

/// Redact credentials and sensitive paths before an error leaves the device
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

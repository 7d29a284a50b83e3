//! Payloads published by the agent itself

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured error published on a capability's response topic
///
/// # Examples
/// ```
/// use connector_agent::protocol::{ErrorCode, ErrorPayload};
///
/// let payload = ErrorPayload::new(ErrorCode::DecodeError, "expected a JSON object", None);
/// let json = serde_json::to_string(&payload).unwrap();
/// assert!(json.contains("\"decode_error\""));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub error: ErrorDetails,
    /// Correlation identifier copied from the request, when it carried one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>, id: Option<Value>) -> Self {
        Self {
            error: ErrorDetails {
                code,
                message: message.into(),
            },
            id,
        }
    }

    /// True when a JSON value has the error payload shape
    pub fn matches(value: &Value) -> bool {
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .is_some_and(Value::is_string)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    /// Human-readable description (sanitized)
    pub message: String,
}

/// Error codes carried by [`ErrorPayload`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Request payload was not a JSON object
    DecodeError,
    /// The capability reported a failure
    HandlerError,
    /// The capability faulted while running
    HandlerPanicked,
    InternalError,
}

/// Presence published on `<client id>/status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceMessage {
    pub status: PresenceStatus,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl PresenceMessage {
    pub fn now(status: PresenceStatus) -> Self {
        Self {
            status,
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

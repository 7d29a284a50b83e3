//! Error kinds surfaced by the device authorization flow

use super::http::HttpError;
use thiserror::Error;

/// Outcome kinds of a device authorization attempt
///
/// The polling loop branches on these, so provider responses map to distinct
/// variants rather than a generic failure.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Transport error: {0}")]
    Transport(#[from] HttpError),

    #[error("Failed to decode {context} response: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Authorization pending")]
    AuthorizationPending,

    #[error("Provider requested a slower polling rate")]
    SlowDown,

    #[error("Device code expired at the provider")]
    ExpiredToken,

    #[error("Authorization denied")]
    AccessDenied,

    #[error("Unexpected HTTP status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Device code not authorized within {expires_in}s")]
    DeviceCodeExpired { expires_in: u64 },

    #[error("Authorization cancelled")]
    Cancelled,
}

impl AuthError {
    /// Informational outcomes that keep the polling loop alive
    pub fn is_pending(&self) -> bool {
        matches!(self, AuthError::AuthorizationPending | AuthError::SlowDown)
    }

    /// Failures that may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        self.is_pending() || matches!(self, AuthError::Transport(_))
    }
}

//! Capability topic naming
//!
//! A capability with base topic `T` receives requests on `T/post` and answers
//! on `T`. When the agent serves its client-id subspace as well, the same
//! capability is reachable on `<id>T/post` and answers on `<id>T`.

use thiserror::Error;

/// Suffix of every inbound command channel
pub const POST_SUFFIX: &str = "/post";

/// Inbound channel for a base topic: `<base>/post`
pub fn inbound_topic(base: &str) -> String {
    format!("{base}{POST_SUFFIX}")
}

/// Base topic moved into a client-id subspace: `<namespace><base>`
pub fn namespaced_topic(namespace: &str, base: &str) -> String {
    format!("{namespace}{base}")
}

/// Presence topic for a client id: `<id>/status`
pub fn presence_topic(client_id: &str) -> String {
    format!("{client_id}/status")
}

/// Check a capability base topic
///
/// Base topics are literal (no wildcards), start with `/`, have no empty
/// levels and are not themselves inbound channels.
pub fn validate_base_topic(base: &str) -> Result<(), TopicError> {
    if base.is_empty() || base == "/" {
        return Err(TopicError::Empty);
    }
    if !base.starts_with('/') {
        return Err(TopicError::MissingLeadingSlash(base.to_string()));
    }
    if base.contains('+') || base.contains('#') {
        return Err(TopicError::Wildcard(base.to_string()));
    }
    if base.ends_with('/') || base.contains("//") {
        return Err(TopicError::EmptyLevel(base.to_string()));
    }
    if base.ends_with(POST_SUFFIX) {
        return Err(TopicError::InboundSuffix(base.to_string()));
    }
    Ok(())
}

/// Base topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Base topic cannot be empty")]
    Empty,
    #[error("Base topic must start with '/': {0}")]
    MissingLeadingSlash(String),
    #[error("Base topic must not contain wildcards: {0}")]
    Wildcard(String),
    #[error("Base topic must not contain empty levels: {0}")]
    EmptyLevel(String),
    #[error("Base topic must not end with '/post': {0}")]
    InboundSuffix(String),
}

//! Connector Agent
//!
//! Device-resident control agent. It obtains a bearer credential through the
//! OAuth 2.0 Device Authorization Grant, opens a persistent MQTT session with
//! it, and serves command capabilities on a topic-routed request/response
//! convention: a command sent to `<base>/post` is answered on `<base>`.
//!
//! # Overview
//!
//! - [`auth`] - device authorization against the identity provider
//! - [`transport`] - the broker session ([`transport::Transport`], MQTT v5)
//! - [`dispatch`] - topic registry, dispatcher and round-trip requester
//! - [`status`] - single-writer agent state
//! - [`handlers`] - capabilities shipped with the agent
//! - [`agent`] - startup and shutdown sequencing
//!
//! # Quick Start
//!
//! ```rust
//! use connector_agent::protocol::{inbound_topic, namespaced_topic, ErrorCode, ErrorPayload};
//! use serde_json::json;
//!
//! assert_eq!(inbound_topic("/apt/repos/list"), "/apt/repos/list/post");
//! assert_eq!(namespaced_topic("device-01", "/apt/repos/list"), "device-01/apt/repos/list");
//!
//! let error = ErrorPayload::new(ErrorCode::DecodeError, "not a JSON object", Some(json!(7)));
//! let wire = serde_json::to_value(&error).unwrap();
//! assert_eq!(wire["error"]["code"], "decode_error");
//! ```

pub mod agent;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod observability;
pub mod protocol;
pub mod status;
pub mod testing;
pub mod transport;

pub use agent::AgentLifecycle;
pub use auth::{Credential, DeviceAuthenticator, DeviceCode};
pub use config::*;
pub use dispatch::{CommandHandler, CommandRequester, Dispatcher, TopicRegistry};
pub use error::{AgentError, AgentResult, CommandError, HandlerError};
pub use protocol::*;
pub use transport::mqtt::MqttClient;

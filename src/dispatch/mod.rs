//! Topic router and dispatcher
//!
//! A capability registered with base topic `T` receives commands on `T/post`
//! and answers on `T`. The [`TopicRegistry`] is built at startup, the
//! [`Dispatcher`] consumes the session's inbound channel and runs handlers
//! off the delivery path, and the publisher task turns queued
//! [`OutboundMessage`]s into session publishes.

pub mod dispatcher;
pub mod handler;
pub mod publisher;
pub mod registry;
pub mod requester;
pub mod responder;

pub use dispatcher::{decode_payload, DecodedPayload, Dispatcher};
pub use handler::{CommandHandler, CommandRequest, HandlerContext, HandlerOutcome, Reply};
pub use publisher::{spawn_publisher, OUTBOUND_CHANNEL_CAPACITY};
pub use registry::{InvocationMode, RegistryError, TopicBinding, TopicRegistry};
pub use requester::{CommandRequester, RequestError};
pub use responder::{OutboundMessage, Responder};

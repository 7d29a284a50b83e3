//! Command handler contract

use super::responder::Responder;
use crate::error::HandlerError;
use crate::status::{StatusIntent, StatusView};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

/// A decoded inbound command
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Invocation id assigned by the dispatcher
    pub id: Uuid,
    /// Topic the command arrived on
    pub topic: String,
    /// Capability base topic the binding was registered with
    pub base: String,
    pub payload: Map<String, Value>,
    /// Caller-supplied `"id"`, echoed in error payloads
    pub correlation_id: Option<Value>,
}

impl CommandRequest {
    /// Deserialize the payload into a handler-specific request type
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|e| HandlerError::new(format!("Invalid request: {e}")))
    }
}

/// What a handler gets besides the request
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub status: StatusView,
    pub responder: Responder,
}

/// How the handler answered
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Serialized and published on the response topic by the dispatcher
    Json(Value),
    /// The handler published its own response(s) through the [`Responder`]
    Emitted,
}

/// Successful handler result plus the state changes it asks for
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    pub reply: Reply,
    pub intents: Vec<StatusIntent>,
}

impl HandlerOutcome {
    pub fn json(value: Value) -> Self {
        Self {
            reply: Reply::Json(value),
            intents: Vec::new(),
        }
    }

    pub fn emitted() -> Self {
        Self {
            reply: Reply::Emitted,
            intents: Vec::new(),
        }
    }

    pub fn with_intent(mut self, intent: StatusIntent) -> Self {
        self.intents.push(intent);
        self
    }
}

/// Capability logic invoked by the dispatcher
///
/// Brokers deliver at least once, so the same command can arrive twice.
/// Handlers that are not naturally idempotent must detect duplicates
/// themselves; the dispatcher does not de-duplicate.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn handle(
        &self,
        request: CommandRequest,
        ctx: HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError>;
}

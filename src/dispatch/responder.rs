//! Response emission bound to one capability's response topic

use crate::error::HandlerError;
use serde::Serialize;
use tokio::sync::mpsc;

/// A message queued for the session's publisher
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Publishes on the response topic of the binding that received the command
///
/// Handlers that stream partial results call [`Responder::emit`] as often as
/// they need and return [`super::Reply::Emitted`].
#[derive(Debug, Clone)]
pub struct Responder {
    topic: String,
    retain: bool,
    outbound: mpsc::Sender<OutboundMessage>,
}

impl Responder {
    pub fn new(topic: impl Into<String>, retain: bool, outbound: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            topic: topic.into(),
            retain,
            outbound,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    /// Serialize `value` as JSON and queue it
    pub async fn emit<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), HandlerError> {
        let payload = serde_json::to_vec(value)?;
        self.emit_raw(payload).await
    }

    /// Queue an already-encoded payload
    pub async fn emit_raw(&self, payload: Vec<u8>) -> Result<(), HandlerError> {
        self.outbound
            .send(OutboundMessage {
                topic: self.topic.clone(),
                payload,
                retain: self.retain,
            })
            .await
            .map_err(|_| HandlerError::new("Publisher stopped"))
    }
}

//! Pub/sub session abstraction
//!
//! The rest of the agent reaches the broker only through [`Transport`]: an
//! abstract send plus receive-on-topic capability. Inbound messages are handed
//! to a channel owned by the dispatcher, never processed on the transport's
//! own task.

use bytes::Bytes;
use tokio::sync::mpsc;

pub mod mqtt;

/// A message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}

/// Transport trait for the broker session
///
/// Delivery is at-least-once per subscribed topic; consumers that are not
/// naturally idempotent must tolerate duplicates themselves.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the broker
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Disconnect from the broker
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Enqueue a message for the broker
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool)
    -> Result<(), Self::Error>;

    /// Subscribe a topic; the subscription survives reconnects
    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error>;

    /// Route every inbound message to `sender`
    async fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>);

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state
    fn connection_state(&self) -> Option<crate::transport::mqtt::ConnectionState>;

    /// Check if the connection is permanently disconnected
    fn is_permanently_disconnected(&self) -> bool;
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;

//! Event routing and inbound forwarding for the MQTT session
//!
//! Routing decisions are pure; the only I/O here is handing an inbound
//! message to the dispatcher's channel.

use crate::transport::InboundMessage;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Filter, Packet};
use rumqttc::v5::{Event, mqttbytes::QoS};
use rumqttc::Outgoing;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pure routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT event to the matching session action
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    topic_count: suback.return_codes.len(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// One SUBSCRIBE packet's worth of filters for the tracked topics
    pub fn subscription_filters(topics: &[String]) -> Vec<Filter> {
        topics
            .iter()
            .map(|topic| Filter::new(topic.clone(), Self::qos()))
            .collect()
    }

    /// Decide whether an inbound publish reaches the dispatcher
    ///
    /// Retained commands are stale by definition and would be replayed on every
    /// reconnect, so they are dropped. Topics outside the tracked subscriptions
    /// are dropped as well.
    pub fn should_forward(topic: &str, retain: bool, subscribed: &[String]) -> bool {
        if retain {
            debug!(topic, "Ignoring retained message");
            return false;
        }

        if !subscribed.iter().any(|t| t == topic) {
            debug!(topic, "Ignoring message on untracked topic");
            return false;
        }

        true
    }

    /// All traffic uses at-least-once delivery
    pub fn qos() -> QoS {
        QoS::AtLeastOnce
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged, ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// Broker closed the session
    Disconnected,
    /// Subscription confirmed
    SubscriptionConfirmed { packet_id: u16, topic_count: usize },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Our DISCONNECT has been written; everything queued before it is out
    DisconnectSent,
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Hands inbound messages to the dispatcher
#[derive(Default)]
pub struct MessageForwarder {
    sender: Option<mpsc::Sender<InboundMessage>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self { sender: None }
    }

    pub fn set_sender(&mut self, sender: mpsc::Sender<InboundMessage>) {
        self.sender = Some(sender);
    }

    pub fn has_sender(&self) -> bool {
        self.sender.is_some()
    }

    /// Forward one inbound message; waits when the dispatcher is behind
    pub async fn forward(&self, message: InboundMessage) -> Result<(), String> {
        match self.sender {
            Some(ref sender) => sender
                .send(message)
                .await
                .map_err(|e| format!("Failed to forward message to dispatcher: {e}")),
            None => {
                warn!(
                    topic = %message.topic,
                    "Received MQTT message but no dispatcher attached - message dropped"
                );
                Err("No message sender configured".to_string())
            }
        }
    }
}

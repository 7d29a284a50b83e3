//! Outbound publisher task
//!
//! Responses from every handler funnel through one channel into the session,
//! so nothing but the session ever touches the broker.

use super::responder::OutboundMessage;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Capacity of the outbound queue shared by all handlers
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Publish every queued message until all senders are dropped
pub fn spawn_publisher<T>(transport: Arc<T>, mut rx: mpsc::Receiver<OutboundMessage>) -> JoinHandle<()>
where
    T: Transport + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let topic = message.topic;
            match transport.publish(&topic, message.payload, message.retain).await {
                Ok(()) => debug!(topic = %topic, "Response published"),
                Err(e) => error!(topic = %topic, error = %e, "Failed to publish response"),
            }
        }
        info!("Outbound publisher stopped");
    })
}

//! Caller side of a request/response round trip
//!
//! Publishes a request on `<base>/post` and waits a bounded time for the
//! answer on `<base>`. A timeout does not cancel the remote handler; a late
//! response simply goes unconsumed.

use crate::protocol::{inbound_topic, ErrorPayload};
use crate::transport::{InboundMessage, Transport};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Round-trip failures
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("No response on {topic} within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },
    #[error("Response is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Remote handler failed: {} ({:?})", .0.error.message, .0.error.code)]
    Remote(ErrorPayload),
    #[error("Inbound channel closed")]
    Closed,
}

/// Issues commands and waits for their responses
pub struct CommandRequester<T: Transport> {
    transport: Arc<T>,
    inbound: Mutex<mpsc::Receiver<InboundMessage>>,
}

impl<T> CommandRequester<T>
where
    T: Transport + 'static,
{
    /// Take over the transport's inbound channel
    pub async fn new(transport: Arc<T>) -> Self {
        let (tx, rx) = mpsc::channel(32);
        transport.set_message_sender(tx).await;
        Self {
            transport,
            inbound: Mutex::new(rx),
        }
    }

    /// Send `payload` to `<base>/post` and return the JSON published on `<base>`
    ///
    /// Structured error payloads come back as [`RequestError::Remote`].
    pub async fn request(
        &self,
        base: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let body = serde_json::to_vec(payload)?;

        // Holding the receiver for the whole round trip keeps concurrent
        // requests from stealing each other's responses.
        let mut inbound = self.inbound.lock().await;
        while inbound.try_recv().is_ok() {}

        self.transport
            .subscribe(base)
            .await
            .map_err(|e| RequestError::Transport(e.to_string()))?;
        self.transport
            .publish(&inbound_topic(base), body, false)
            .await
            .map_err(|e| RequestError::Transport(e.to_string()))?;
        debug!(topic = %inbound_topic(base), "Request published");

        let response = tokio::time::timeout(timeout, async {
            loop {
                match inbound.recv().await {
                    Some(message) if message.topic == base => return Ok(message),
                    Some(message) => debug!(topic = %message.topic, "Ignoring unrelated message"),
                    None => return Err(RequestError::Closed),
                }
            }
        })
        .await
        .map_err(|_| RequestError::Timeout {
            topic: base.to_string(),
            timeout,
        })??;

        let value: Value = serde_json::from_slice(&response.payload)?;
        if ErrorPayload::matches(&value) {
            return Err(RequestError::Remote(serde_json::from_value(value)?));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use serde_json::json;

    #[tokio::test]
    async fn test_request_round_trip() {
        let transport = Arc::new(MockTransport::new());
        let requester = CommandRequester::new(transport.clone()).await;

        let device = transport.clone();
        tokio::spawn(async move {
            let request = device
                .wait_for_message("/apt/repos/list/post", Duration::from_secs(1))
                .await
                .expect("request published");
            assert_eq!(request.json(), json!({}));
            device.inject("/apt/repos/list", "[]").await;
        });

        let response = requester
            .request("/apt/repos/list", &json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, json!([]));
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let transport = Arc::new(MockTransport::new());
        let requester = CommandRequester::new(transport).await;

        let err = requester
            .request("/status", &json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_remote_error_payload() {
        let transport = Arc::new(MockTransport::new());
        let requester = CommandRequester::new(transport.clone()).await;

        let device = transport.clone();
        tokio::spawn(async move {
            device
                .wait_for_message("/x/post", Duration::from_secs(1))
                .await;
            device
                .inject(
                    "/x",
                    r#"{"error":{"code":"decode_error","message":"bad"}}"#,
                )
                .await;
        });

        let err = requester
            .request("/x", &json!([]), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            RequestError::Remote(payload) => assert_eq!(payload.error.message, "bad"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let transport = Arc::new(MockTransport::with_failure());
        let requester = CommandRequester::new(transport).await;

        let err = requester
            .request("/x", &json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Transport(_)));
    }
}

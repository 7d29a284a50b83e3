//! Mock implementations for testing
//!
//! Provides an in-memory [`Transport`] and a scripted [`HttpClient`] so the
//! dispatcher and the authenticator can be exercised without a broker or an
//! identity provider.

use crate::auth::{HttpClient, HttpError, HttpRequest, HttpResponse};
use crate::error::AgentError;
use crate::transport::{mqtt::ConnectionState, InboundMessage, Transport};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};

/// A message recorded by [`MockTransport::publish`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl PublishedMessage {
    /// Payload parsed as JSON
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// In-memory transport for testing
#[derive(Debug, Default)]
pub struct MockTransport {
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<String>>>,
    pub should_fail: bool,
    connected: AtomicBool,
    message_sender: Arc<Mutex<Option<mpsc::Sender<InboundMessage>>>>,
    published: Arc<Notify>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation fails
    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    pub async fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published_messages.lock().await.clear();
    }

    /// Deliver a message as if the broker had routed it to this session
    ///
    /// Only subscribed topics are delivered, like a real broker. Returns
    /// whether the message reached the dispatcher channel.
    pub async fn inject(&self, topic: &str, payload: impl Into<bytes::Bytes>) -> bool {
        if !self.subscriptions.lock().await.iter().any(|t| t == topic) {
            return false;
        }
        let sender = self.message_sender.lock().await.clone();
        match sender {
            Some(sender) => sender
                .send(InboundMessage::new(topic, payload))
                .await
                .is_ok(),
            None => false,
        }
    }

    /// Wait until a message is published on `topic`
    pub async fn wait_for_message(&self, topic: &str, timeout: Duration) -> Option<PublishedMessage> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.published.notified();
                if let Some(message) = self.find_message(topic).await {
                    return message;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    /// Wait until `count` messages have been published on `topic`
    pub async fn wait_for_messages(
        &self,
        topic: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<PublishedMessage> {
        let collect = || async {
            self.published_messages
                .lock()
                .await
                .iter()
                .filter(|m| m.topic == topic)
                .cloned()
                .collect::<Vec<_>>()
        };

        let _ = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.published.notified();
                if collect().await.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;

        collect().await
    }

    async fn find_message(&self, topic: &str) -> Option<PublishedMessage> {
        self.published_messages
            .lock()
            .await
            .iter()
            .find(|m| m.topic == topic)
            .cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = AgentError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(AgentError::internal_error("Mock connection failure"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(AgentError::internal_error("Mock publish failure"));
        }

        self.published_messages.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            retain,
        });
        self.published.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error> {
        if self.should_fail {
            return Err(AgentError::internal_error("Mock subscribe failure"));
        }

        let mut subscriptions = self.subscriptions.lock().await;
        if !subscriptions.iter().any(|t| t == topic) {
            subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    async fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        *self.message_sender.lock().await = Some(sender);
    }

    fn is_connected(&self) -> bool {
        !self.should_fail && self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        if self.should_fail {
            Some(ConnectionState::Disconnected("Mock disconnection".to_string()))
        } else if self.connected.load(Ordering::SeqCst) {
            Some(ConnectionState::Connected)
        } else {
            None
        }
    }

    fn is_permanently_disconnected(&self) -> bool {
        false
    }
}

type Responder = dyn Fn(&HttpRequest) -> Result<HttpResponse, HttpError> + Send + Sync;

/// Scripted HTTP client for testing the authenticator
///
/// Either answers every request through a closure or replays a fixed
/// sequence of results. Every request is recorded.
pub struct MockHttpClient {
    responder: Option<Box<Responder>>,
    script: std::sync::Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
    requests: std::sync::Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, HttpError> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            script: std::sync::Mutex::new(VecDeque::new()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Replay `results` in order; further requests fail with a setup error
    pub fn sequence(results: Vec<Result<HttpResponse, HttpError>>) -> Self {
        Self {
            responder: None,
            script: std::sync::Mutex::new(results.into()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        if let Some(responder) = &self.responder {
            return responder(&request);
        }

        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| Err(HttpError::Setup("mock script exhausted".to_string())))
    }
}

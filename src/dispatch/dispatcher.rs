//! The dispatcher loop
//!
//! Receives inbound messages from the session channel, looks up the binding,
//! decodes the payload and runs the handler off the delivery path. Every
//! command produces exactly one response or error payload on the binding's
//! response topic unless the handler emitted its own.

use super::handler::{CommandRequest, HandlerContext, HandlerOutcome, Reply};
use super::registry::{InvocationMode, TopicBinding, TopicRegistry};
use super::responder::{OutboundMessage, Responder};
use crate::error::CommandError;
use crate::status::{StatusHandle, StatusIntent};
use crate::transport::InboundMessage;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument, Span};
use uuid::Uuid;

/// How long shutdown waits for running handlers
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Work queued for a sequential capability's worker
///
/// Unbounded so that routing never waits on a busy capability.
type SequentialQueue = mpsc::UnboundedSender<(Arc<TopicBinding>, InboundMessage, Span)>;

/// Decoded payload plus its correlation id
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub payload: Map<String, Value>,
    pub correlation_id: Option<Value>,
}

/// Decode an inbound payload
///
/// An empty payload is treated as `{}`. Anything else must be a JSON object.
pub fn decode_payload(raw: &[u8]) -> Result<DecodedPayload, CommandError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(DecodedPayload {
            payload: Map::new(),
            correlation_id: None,
        });
    }

    let value: Value =
        serde_json::from_slice(raw).map_err(|e| CommandError::decode(e.to_string()))?;
    match value {
        Value::Object(payload) => {
            let correlation_id = extract_correlation_id(&payload);
            Ok(DecodedPayload {
                payload,
                correlation_id,
            })
        }
        other => Err(CommandError::decode(format!(
            "expected a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

/// String or number `"id"` field, if any
pub fn extract_correlation_id(payload: &Map<String, Value>) -> Option<Value> {
    payload
        .get("id")
        .filter(|id| id.is_string() || id.is_number())
        .cloned()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Text carried by a panic payload
fn panic_message(error: JoinError) -> String {
    if error.is_cancelled() {
        return "handler task was cancelled".to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Handler task that is aborted when its invocation is dropped
struct HandlerTask<T>(JoinHandle<T>);

impl<T> Future for HandlerTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for HandlerTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Everything one invocation needs, independent of the dispatcher
#[derive(Clone)]
struct Invoker {
    status: StatusHandle,
    outbound: mpsc::Sender<OutboundMessage>,
}

impl Invoker {
    /// Run one command to completion and publish its response
    async fn invoke(&self, binding: Arc<TopicBinding>, message: InboundMessage) {
        let id = Uuid::new_v4();
        let decoded = match decode_payload(&message.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Rejected malformed command");
                self.publish_error(&binding, &e, None).await;
                self.status
                    .submit(StatusIntent::CommandFinished { id, success: false })
                    .await;
                return;
            }
        };

        self.status
            .submit(StatusIntent::CommandStarted {
                id,
                topic: message.topic.clone(),
                correlation_id: decoded.correlation_id.clone(),
            })
            .await;

        let correlation_id = decoded.correlation_id.clone();
        let request = CommandRequest {
            id,
            topic: message.topic,
            base: binding.base.clone(),
            payload: decoded.payload,
            correlation_id: decoded.correlation_id,
        };
        let ctx = HandlerContext {
            status: self.status.view(),
            responder: Responder::new(binding.response.clone(), binding.retain, self.outbound.clone()),
        };

        let handler = binding.handler.clone();
        let result = HandlerTask(tokio::spawn(async move { handler.handle(request, ctx).await }))
            .await
            .map_err(|e| CommandError::HandlerPanicked {
                message: panic_message(e),
            })
            .and_then(|result| result.map_err(CommandError::from));

        let success = match result {
            Ok(outcome) => self.complete(&binding, outcome).await,
            Err(e) => {
                error!(handler = binding.handler.name(), error = %e, "Command failed");
                self.publish_error(&binding, &e, correlation_id).await;
                false
            }
        };

        self.status
            .submit(StatusIntent::CommandFinished { id, success })
            .await;
    }

    async fn complete(&self, binding: &TopicBinding, outcome: HandlerOutcome) -> bool {
        self.status.submit_all(outcome.intents).await;

        match outcome.reply {
            Reply::Json(value) => match serde_json::to_vec(&value) {
                Ok(payload) => {
                    self.publish(binding, payload).await;
                    true
                }
                Err(e) => {
                    let error = CommandError::internal(format!("Failed to encode reply: {e}"));
                    self.publish_error(binding, &error, None).await;
                    false
                }
            },
            Reply::Emitted => true,
        }
    }

    async fn publish_error(
        &self,
        binding: &TopicBinding,
        error: &CommandError,
        correlation_id: Option<Value>,
    ) {
        match serde_json::to_vec(&error.to_error_payload(correlation_id)) {
            Ok(payload) => self.publish(binding, payload).await,
            Err(e) => error!(error = %e, "Failed to encode error payload"),
        }
    }

    async fn publish(&self, binding: &TopicBinding, payload: Vec<u8>) {
        let message = OutboundMessage {
            topic: binding.response.clone(),
            payload,
            retain: binding.retain,
        };
        if self.outbound.send(message).await.is_err() {
            error!(topic = %binding.response, "Publisher stopped - response dropped");
        }
    }
}

/// Routes inbound messages to handlers
pub struct Dispatcher {
    registry: Arc<TopicRegistry>,
    invoker: Invoker,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TopicRegistry>,
        status: StatusHandle,
        outbound: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        Self {
            registry,
            invoker: Invoker { status, outbound },
        }
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// One FIFO worker per sequential capability, shared by its scoped and plain topics
    fn spawn_sequential_workers(&self, tasks: &mut JoinSet<()>) -> HashMap<String, SequentialQueue> {
        let mut workers = HashMap::new();
        for binding in self.registry.bindings() {
            if binding.mode != InvocationMode::Sequential || workers.contains_key(&binding.base) {
                continue;
            }

            let (tx, mut rx) = mpsc::unbounded_channel::<(Arc<TopicBinding>, InboundMessage, Span)>();
            let invoker = self.invoker.clone();
            tasks.spawn(async move {
                while let Some((binding, message, span)) = rx.recv().await {
                    invoker.invoke(binding, message).instrument(span).await;
                }
            });
            workers.insert(binding.base.clone(), tx);
        }
        workers
    }

    /// Run until `shutdown` flips to true or the inbound channel closes
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tasks = JoinSet::new();
        let mut sequential = self.spawn_sequential_workers(&mut tasks);
        info!(bindings = self.registry.len(), "Dispatcher started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Dispatcher task failed");
                    }
                }

                message = inbound.recv() => {
                    match message {
                        Some(message) => self.route(message, &mut tasks, &sequential),
                        None => break,
                    }
                }
            }
        }

        sequential.clear();
        Self::drain(tasks).await;
        info!("Dispatcher stopped");
    }

    /// Hand a message to its worker or a fresh task; never waits
    fn route(
        &self,
        message: InboundMessage,
        tasks: &mut JoinSet<()>,
        sequential: &HashMap<String, SequentialQueue>,
    ) {
        let Some(binding) = self.registry.lookup(&message.topic) else {
            let violation = CommandError::ProtocolViolation {
                topic: message.topic.clone(),
            };
            warn!(error = %violation, "Dropping message");
            return;
        };

        debug!(topic = %message.topic, handler = binding.handler.name(), "Dispatching command");
        let span = crate::command_span!(binding.handler.name(), &message.topic);

        match sequential.get(&binding.base) {
            Some(worker) => {
                if worker.send((binding, message, span)).is_err() {
                    error!("Sequential worker stopped - message dropped");
                }
            }
            None => {
                let invoker = self.invoker.clone();
                tasks.spawn(async move { invoker.invoke(binding, message).await }.instrument(span));
            }
        }
    }

    async fn drain(mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        let pending = tasks.len();
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(pending, "Handlers still running at shutdown - aborting");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

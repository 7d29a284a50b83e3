//! Test helpers and utilities for integration tests

use async_trait::async_trait;
use connector_agent::config::{AgentConfig, AgentSection, AptSection, MqttSection};
use connector_agent::dispatch::{
    spawn_publisher, CommandHandler, CommandRequest, Dispatcher, HandlerContext, HandlerOutcome,
    TopicRegistry,
};
use connector_agent::error::HandlerError;
use connector_agent::status::{AgentState, StatusHandle, StatusOwner};
use connector_agent::testing::MockTransport;
use connector_agent::transport::Transport;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Create a test configuration for integration tests
#[allow(dead_code)]
pub fn test_config(sources_dir: &Path) -> AgentConfig {
    AgentConfig {
        agent: AgentSection {
            id: "test-device".to_string(),
            description: "Device under integration test".to_string(),
        },
        auth: None,
        mqtt: MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            namespace_topics: false,
            max_reconnect_attempts: None,
        },
        apt: AptSection {
            sources_dir: sources_dir.to_path_buf(),
        },
    }
}

/// A dispatcher wired to a [`MockTransport`], without the lifecycle around it
#[allow(dead_code)]
pub struct DispatchHarness {
    pub transport: Arc<MockTransport>,
    pub status: StatusHandle,
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    publisher: JoinHandle<()>,
}

#[allow(dead_code)]
impl DispatchHarness {
    pub async fn start(registry: TopicRegistry, config: AgentConfig) -> Self {
        let transport = Arc::new(MockTransport::new());
        let (status, _owner) = StatusOwner::spawn(AgentState::new(Arc::new(config)));

        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        transport.set_message_sender(inbound_tx).await;
        for topic in registry.inbound_topics() {
            transport.subscribe(&topic).await.unwrap();
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let publisher = spawn_publisher(transport.clone(), outbound_rx);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(Arc::new(registry), status.clone(), outbound_tx);
        let dispatcher = tokio::spawn(dispatcher.run(inbound_rx, shutdown_rx));

        Self {
            transport,
            status,
            shutdown,
            dispatcher,
            publisher,
        }
    }

    /// Signal shutdown and wait for the dispatcher, then the publisher, to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(10), self.dispatcher)
            .await
            .expect("dispatcher stops")
            .expect("dispatcher did not panic");
        tokio::time::timeout(Duration::from_secs(10), self.publisher)
            .await
            .expect("publisher stops")
            .expect("publisher did not panic");
    }
}

/// Replies `{"echo": <payload>}` after an optional delay
#[allow(dead_code)]
pub struct EchoHandler {
    pub delay: Duration,
}

#[async_trait]
impl CommandHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn handle(
        &self,
        request: CommandRequest,
        _ctx: HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        tokio::time::sleep(self.delay).await;
        Ok(HandlerOutcome::json(json!({ "echo": request.payload })))
    }
}

/// Panics on every invocation
#[allow(dead_code)]
pub struct PanickingHandler;

#[async_trait]
impl CommandHandler for PanickingHandler {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn handle(
        &self,
        _request: CommandRequest,
        _ctx: HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        panic!("handler exploded");
    }
}

/// Fails every invocation with a handler error
#[allow(dead_code)]
pub struct FailingHandler;

#[async_trait]
impl CommandHandler for FailingHandler {
    fn name(&self) -> &str {
        "failing"
    }

    async fn handle(
        &self,
        _request: CommandRequest,
        _ctx: HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        Err(HandlerError::new("nope"))
    }
}

/// Publishes `{"part": n}` for each of `parts` through its responder
#[allow(dead_code)]
pub struct StreamingHandler {
    pub parts: usize,
}

#[async_trait]
impl CommandHandler for StreamingHandler {
    fn name(&self) -> &str {
        "streaming"
    }

    async fn handle(
        &self,
        _request: CommandRequest,
        ctx: HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        for part in 0..self.parts {
            ctx.responder.emit(&json!({ "part": part })).await?;
        }
        Ok(HandlerOutcome::emitted())
    }
}

//! Startup and shutdown sequencing for the agent

use crate::config::AgentConfig;
use crate::dispatch::{
    spawn_publisher, Dispatcher, RegistryError, TopicRegistry, OUTBOUND_CHANNEL_CAPACITY,
};
use crate::handlers::register_default_handlers;
use crate::protocol::{presence_topic, PresenceMessage, PresenceStatus};
use crate::status::{AgentState, SessionStatus, StatusHandle, StatusIntent, StatusOwner, StatusView};
use crate::transport::{InboundMessage, Transport};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// How often the session state is mirrored into the agent status
pub const SESSION_WATCH_INTERVAL: Duration = Duration::from_secs(1);

const INBOUND_CHANNEL_CAPACITY: usize = 100;
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Agent lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Transport error")]
    TransportError(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Capability registration failed")]
    RegistrationError(#[from] RegistryError),
    #[error("Failed to encode presence: {0}")]
    PresenceError(#[from] serde_json::Error),
    #[error("Agent already started")]
    AlreadyStarted,
}

impl LifecycleError {
    fn transport<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::TransportError(Box::new(error))
    }
}

/// Tasks and handles that exist only while the agent runs
struct RunningAgent {
    status: StatusHandle,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    publisher: JoinHandle<()>,
    session_watch: JoinHandle<()>,
    status_owner: JoinHandle<()>,
}

/// Agent lifecycle management with an injected transport
pub struct AgentLifecycle<T>
where
    T: Transport + 'static,
{
    config: Arc<AgentConfig>,
    transport: Option<T>,
    /// Shared session once started; kept after shutdown for inspection
    session: Option<Arc<T>>,
    running: Option<RunningAgent>,
}

impl<T> AgentLifecycle<T>
where
    T: Transport + 'static,
{
    pub fn new(config: AgentConfig, transport: T) -> Self {
        Self {
            config: Arc::new(config),
            transport: Some(transport),
            session: None,
            running: None,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent.id
    }

    /// The transport, whether or not the agent has started
    pub fn transport(&self) -> Option<&T> {
        match &self.session {
            Some(session) => Some(session.as_ref()),
            None => self.transport.as_ref(),
        }
    }

    /// Read side of the agent status while running
    pub fn status(&self) -> Option<StatusView> {
        self.running.as_ref().map(|running| running.status.view())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        self.transport()
            .is_some_and(|transport| transport.is_permanently_disconnected())
    }

    /// Build the registry for this agent's configuration
    fn build_registry(config: &AgentConfig) -> Result<TopicRegistry, RegistryError> {
        let mut registry = match config.topic_namespace() {
            Some(namespace) => TopicRegistry::with_namespace(namespace),
            None => TopicRegistry::new(),
        };
        register_default_handlers(&mut registry, config)?;
        Ok(registry)
    }

    /// Serialized retained presence for this agent
    fn presence(status: PresenceStatus) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&PresenceMessage::now(status))
    }

    /// Mirror the transport's connection state into the status owner
    fn spawn_session_watch(transport: Arc<T>, status: StatusHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_WATCH_INTERVAL);
            let mut last: Option<SessionStatus> = None;

            loop {
                interval.tick().await;
                let Some(state) = transport.connection_state() else {
                    continue;
                };
                let session = SessionStatus::from(&state);
                if last.as_ref() != Some(&session) {
                    debug!(?session, "Session state changed");
                    status
                        .submit(StatusIntent::SessionChanged(session.clone()))
                        .await;
                    last = Some(session);
                }
            }
        })
    }

    /// Connect, register capabilities, subscribe and start dispatching
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        let span = crate::lifecycle_span!(agent_id = %self.config.agent.id, phase = "start");
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&mut self) -> Result<(), LifecycleError> {
        if self.session.is_some() {
            return Err(LifecycleError::AlreadyStarted);
        }
        let Some(mut transport) = self.transport.take() else {
            return Err(LifecycleError::AlreadyStarted);
        };
        info!("Starting agent");

        let (status, status_owner) = StatusOwner::spawn(AgentState::new(self.config.clone()));
        status
            .submit(StatusIntent::SessionChanged(SessionStatus::Connecting))
            .await;

        if let Err(e) = transport.connect().await {
            status_owner.abort();
            self.transport = Some(transport);
            return Err(LifecycleError::transport(e));
        }
        let transport = Arc::new(transport);
        status
            .submit(StatusIntent::SessionChanged(SessionStatus::Connected))
            .await;
        info!("Session connected");

        let registry = Arc::new(Self::build_registry(&self.config)?);

        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(INBOUND_CHANNEL_CAPACITY);
        transport.set_message_sender(inbound_tx).await;
        for topic in registry.inbound_topics() {
            transport
                .subscribe(&topic)
                .await
                .map_err(LifecycleError::transport)?;
            debug!(topic = %topic, "Subscribed");
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let publisher = spawn_publisher(transport.clone(), outbound_rx);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(registry.clone(), status.clone(), outbound_tx);
        let dispatcher = tokio::spawn(dispatcher.run(inbound_rx, shutdown_rx));

        let session_watch = Self::spawn_session_watch(transport.clone(), status.clone());

        transport
            .publish(
                &presence_topic(&self.config.agent.id),
                Self::presence(PresenceStatus::Online)?,
                true,
            )
            .await
            .map_err(LifecycleError::transport)?;

        info!(
            capabilities = registry.len(),
            namespace = registry.namespace().unwrap_or("-"),
            "Agent started"
        );

        self.session = Some(transport);
        self.running = Some(RunningAgent {
            status,
            shutdown_tx,
            dispatcher,
            publisher,
            session_watch,
            status_owner,
        });
        Ok(())
    }

    /// Stop dispatching, flush responses and close the session
    pub async fn shutdown(&mut self) -> Result<(), LifecycleError> {
        let (Some(running), Some(transport)) = (self.running.take(), self.session.clone()) else {
            debug!("Shutdown requested but agent is not running");
            return Ok(());
        };
        let span = crate::lifecycle_span!(agent_id = %self.config.agent.id, phase = "shutdown");

        async move {
            info!("Shutting down agent");

            let _ = running.shutdown_tx.send(true);
            await_task("dispatcher", running.dispatcher).await;
            // Once the dispatcher returns, its handler tasks are finished or aborted and
            // every outbound sender is gone, so the publisher drains and exits.
            await_task("publisher", running.publisher).await;
            running.session_watch.abort();

            running
                .status
                .submit(StatusIntent::SessionChanged(SessionStatus::Disconnected {
                    reason: Some("shutdown".to_string()),
                }))
                .await;

            let result = transport
                .disconnect()
                .await
                .map_err(LifecycleError::transport);
            if let Err(e) = &result {
                warn!(error = %e, "Disconnect failed");
            }

            drop(running.status);
            await_task("status owner", running.status_owner).await;

            info!("Agent shutdown complete");
            result
        }
        .instrument(span)
        .await
    }
}

async fn await_task(name: &str, handle: JoinHandle<()>) {
    match tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await {
        Ok(Ok(())) => debug!(task = name, "Task stopped"),
        Ok(Err(e)) if e.is_cancelled() => debug!(task = name, "Task cancelled"),
        Ok(Err(e)) => error!(task = name, error = %e, "Task failed during shutdown"),
        Err(_) => warn!(task = name, "Task did not stop in time"),
    }
}

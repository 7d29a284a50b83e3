//! rumqttc-backed session
//!
//! Owns the broker connection: a supervisor task polls the event loop,
//! tracks connection state, replays subscriptions after every reconnect and
//! forwards inbound publishes to the dispatcher channel.

use super::connection::{
    configure_mqtt_options, presence_payload, ConnectionState, MqttError, SessionCredentials,
};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use super::supervisor::{ConnectionEvent, ConnectionSupervisor, ReconnectConfig, ReconnectionDecision};
use crate::auth::Credential;
use crate::config::MqttSection;
use crate::protocol::{presence_topic, PresenceStatus};
use crate::transport::{InboundMessage, Transport};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::PublishProperties;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long `disconnect` waits for the supervisor to stop
const SUPERVISOR_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// MQTT session for the connector agent
pub struct MqttClient {
    client_id: String,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: Option<Arc<Mutex<EventLoop>>>,
    config: MqttSection,
    credentials: Option<SessionCredentials>,
    event_loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    message_forwarder: Arc<Mutex<MessageForwarder>>,
}

impl MqttClient {
    /// Create a session; a bearer credential, when given, is consumed into the CONNECT packet
    pub fn new(
        client_id: &str,
        config: MqttSection,
        credential: Option<Credential>,
    ) -> Result<Self, MqttError> {
        let reconnect_config = ReconnectConfig::from_section(&config);
        reconnect_config
            .validate()
            .map_err(MqttError::InvalidReconnectConfig)?;
        let credentials = SessionCredentials::resolve(client_id, &config, credential);
        let (client, event_loop) = Self::create_connection(client_id, &config, credentials.as_ref())?;

        Ok(MqttClient {
            client_id: client_id.to_string(),
            client: Arc::new(Mutex::new(client)),
            event_loop: Some(Arc::new(Mutex::new(event_loop))),
            config,
            credentials,
            event_loop_handle: std::sync::Mutex::new(None),
            state_rx: None,
            state_tx: None,
            shutdown_tx: None,
            reconnect_config,
            subscribed_topics: Arc::new(Mutex::new(Vec::new())),
            message_forwarder: Arc::new(Mutex::new(MessageForwarder::new())),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Topics replayed after every reconnect
    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.subscribed_topics.lock().await.clone()
    }

    /// Route inbound messages to the dispatcher channel
    pub async fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        let mut forwarder = self.message_forwarder.lock().await;
        forwarder.set_sender(sender);
    }

    fn create_connection(
        client_id: &str,
        config: &MqttSection,
        credentials: Option<&SessionCredentials>,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(client_id, config, credentials)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait until the supervisor reports a CONNACK
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let confirmation = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionRejected(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::ConnectionRejected(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionRejected(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match confirmation {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionRejected(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Start the supervisor and wait for the broker to acknowledge the session
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self.event_loop.take().ok_or_else(|| {
            MqttError::ConnectionRejected("Event loop already started".to_string())
        })?;

        let ((state_tx, state_rx), (shutdown_tx, mut shutdown_rx)) =
            Self::setup_connection_channels();
        self.state_rx = Some(state_rx.clone());
        self.state_tx = Some(state_tx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let session = SessionContext {
            client_id: self.client_id.clone(),
            config: self.config.clone(),
            credentials: self.credentials.clone(),
            shared_client: self.client.clone(),
            reconnect_config: self.reconnect_config.clone(),
            subscribed_topics: self.subscribed_topics.clone(),
            message_forwarder: self.message_forwarder.clone(),
            state_tx,
        };

        let supervisor_span = crate::mqtt_span!(client_id = %self.client_id);
        let handle = tokio::spawn(async move {
            info!(client_id = %session.client_id, "Starting MQTT event loop supervisor");
            let mut reconnect_attempts = 0u32;
            let mut current_event_loop = event_loop;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Shutdown signal received, stopping event loop supervisor");
                            break;
                        }
                    }

                    event_result = async {
                        let mut event_loop_guard = current_event_loop.lock().await;
                        event_loop_guard.poll().await
                    } => {
                        let keep_running = match event_result {
                            Ok(event) => {
                                let route = MessageHandler::route_mqtt_event(&event);
                                session
                                    .process_event_route(
                                        route,
                                        &mut reconnect_attempts,
                                        shutdown_rx.clone(),
                                        &mut current_event_loop,
                                    )
                                    .await
                            }
                            Err(e) => {
                                error!(client_id = %session.client_id, error = %e, "MQTT event loop error");
                                session.transition(ConnectionEvent::NetworkError(e.to_string()));
                                session
                                    .attempt_reconnection(
                                        &mut reconnect_attempts,
                                        shutdown_rx.clone(),
                                        &mut current_event_loop,
                                    )
                                    .await
                            }
                        };
                        if !keep_running {
                            break;
                        }
                    }
                }
            }
            info!(client_id = %session.client_id, "MQTT event loop stopped");
        }
        .instrument(supervisor_span));

        if let Ok(mut slot) = self.event_loop_handle.lock() {
            *slot = Some(handle);
        }

        let connection_timeout =
            ConnectionSupervisor::calculate_connection_timeout(&self.reconnect_config);
        Self::wait_for_connection_confirmation(state_rx, connection_timeout).await
    }

    /// Publish retained offline presence and close the session
    ///
    /// The DISCONNECT request is queued behind any pending publishes, so the
    /// supervisor keeps polling until it has been written and then stops on
    /// its own. The shutdown signal is only a fallback after the grace period.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        if let Ok(payload) = presence_payload(PresenceStatus::Offline) {
            if let Err(e) = self
                .publish(&presence_topic(&self.client_id), payload, true)
                .await
            {
                debug!(error = %e, "Offline presence not published");
            }
        }

        let handle = self
            .event_loop_handle
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());

        let client = self.client.lock().await.clone();
        let requested =
            match tokio::time::timeout(SUPERVISOR_SHUTDOWN_GRACE, client.disconnect()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(error = %e, "Disconnect request not queued");
                    false
                }
                Err(_) => {
                    warn!("Request channel stayed full, disconnect not queued");
                    false
                }
            };

        if let Some(mut handle) = handle {
            let drained = if requested {
                tokio::time::timeout(SUPERVISOR_SHUTDOWN_GRACE, &mut handle).await.ok()
            } else {
                None
            };
            match drained {
                Some(Ok(())) => debug!("Event loop supervisor drained and stopped"),
                Some(Err(e)) => warn!(error = %e, "Event loop supervisor ended with error"),
                None => {
                    warn!("Event loop supervisor did not drain in time - stopping it");
                    if let Some(shutdown_tx) = &self.shutdown_tx {
                        let _ = shutdown_tx.send(true);
                    }
                    if tokio::time::timeout(SUPERVISOR_SHUTDOWN_GRACE, &mut handle)
                        .await
                        .is_err()
                    {
                        handle.abort();
                    }
                }
            }
        }

        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(state_tx) = &self.state_tx {
            let _ = state_tx.send(ConnectionState::Disconnected(
                "Client disconnected".to_string(),
            ));
        }

        info!(client_id = %self.client_id, "MQTT session closed");
        Ok(())
    }

    /// Returns None until `connect` has been called
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state_rx = self.state_rx.as_ref().ok_or(MqttError::NotConnected {
            state: ConnectionState::Disconnected("Never connected".to_string()),
        })?;

        let current_state = state_rx.borrow().clone();
        if !ConnectionSupervisor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }

        Ok(())
    }

    /// Publish at least once
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), MqttError> {
        self.check_connection_state()?;

        let client = self.client.lock().await;
        client
            .publish_with_properties(
                topic,
                MessageHandler::qos(),
                retain,
                payload,
                PublishProperties::default(),
            )
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(topic, retain, "Published message");
        Ok(())
    }

    /// Track a topic and subscribe to it when the session is up
    ///
    /// Topics tracked before the first CONNACK, or while reconnecting, are
    /// subscribed when the broker next acknowledges the session.
    pub async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        {
            let mut topics = self.subscribed_topics.lock().await;
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
        }

        if self.check_connection_state().is_err() {
            debug!(topic, "Subscription deferred until the session is acknowledged");
            return Ok(());
        }

        let client = self.client.lock().await;
        client
            .subscribe(topic, MessageHandler::qos())
            .await
            .map_err(|e| {
                MqttError::SubscriptionFailed(format!("Failed to subscribe to {topic}: {e}").into())
            })?;

        info!(topic, "Subscribed");
        Ok(())
    }
}

/// State shared by the supervisor task
struct SessionContext {
    client_id: String,
    config: MqttSection,
    credentials: Option<SessionCredentials>,
    shared_client: Arc<Mutex<AsyncClient>>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    message_forwarder: Arc<Mutex<MessageForwarder>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl SessionContext {
    fn transition(&self, event: ConnectionEvent) {
        let next = ConnectionSupervisor::determine_next_state(event);
        let previous = self.state_tx.borrow().clone();
        ConnectionSupervisor::log_state_transition(&previous, &next);
        let _ = self.state_tx.send(next);
    }

    /// Returns false when the supervisor should stop
    async fn process_event_route(
        &self,
        route: EventRoute,
        reconnect_attempts: &mut u32,
        shutdown_rx: watch::Receiver<bool>,
        current_event_loop: &mut Arc<Mutex<EventLoop>>,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.transition(ConnectionEvent::ConnAckReceived);
                *reconnect_attempts = 0;
                self.resubscribe_to_topics().await;
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                self.handle_message_received(topic, payload, retain).await;
                true
            }
            EventRoute::Disconnected => {
                self.transition(ConnectionEvent::DisconnectedByBroker);
                self.attempt_reconnection(reconnect_attempts, shutdown_rx, current_event_loop)
                    .await
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                topic_count,
            } => {
                debug!(target: "mqtt_transport", packet_id, topic_count, "Subscription confirmed");
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::DisconnectSent => {
                debug!(target: "mqtt_transport", "Disconnect written, stopping supervisor");
                false
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_message_received(&self, topic: String, payload: bytes::Bytes, retain: bool) {
        debug!(target: "mqtt_transport", topic = %topic, "Received MQTT message");

        let forward = {
            let topics = self.subscribed_topics.lock().await;
            MessageHandler::should_forward(&topic, retain, &topics)
        };
        if !forward {
            return;
        }

        let forwarder = self.message_forwarder.lock().await;
        if let Err(e) = forwarder
            .forward(InboundMessage {
                topic,
                payload,
                retain,
            })
            .await
        {
            error!("Failed to forward inbound message: {}", e);
        }
    }

    /// Replay tracked subscriptions without blocking the event loop
    ///
    /// The request channel is only emptied by `poll`, which runs on this same
    /// task, so the batch is queued with `try_subscribe_many` and handed to a
    /// separate task when the channel is full.
    async fn resubscribe_to_topics(&self) {
        let topics = self.subscribed_topics.lock().await.clone();
        if topics.is_empty() {
            return;
        }
        let client = self.shared_client.lock().await.clone();
        let filters = MessageHandler::subscription_filters(&topics);

        match client.try_subscribe_many(filters.clone()) {
            Ok(()) => debug!(target: "mqtt_transport", count = topics.len(), "Resubscribed"),
            Err(e) => {
                debug!(target: "mqtt_transport", error = %e, "Request channel busy, resubscribing in background");
                tokio::spawn(async move {
                    match client.subscribe_many(filters).await {
                        Ok(()) => debug!(target: "mqtt_transport", count = topics.len(), "Resubscribed"),
                        Err(e) => error!(error = %e, "Failed to resubscribe"),
                    }
                });
            }
        }
    }

    /// Returns false when the supervisor should stop
    async fn attempt_reconnection(
        &self,
        reconnect_attempts: &mut u32,
        shutdown_rx: watch::Receiver<bool>,
        current_event_loop: &mut Arc<Mutex<EventLoop>>,
    ) -> bool {
        let decision = ConnectionSupervisor::should_attempt_reconnection(
            *reconnect_attempts,
            &self.reconnect_config,
            *shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *reconnect_attempts = attempt;
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));

                if !interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                    return false;
                }
                if *shutdown_rx.borrow() {
                    return false;
                }

                self.apply_new_connection(current_event_loop).await;
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown requested, not reconnecting");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.reconnect_config.max_attempts.unwrap_or_default()
                );
                self.transition(ConnectionEvent::PermanentFailure(reason));
                false
            }
        }
    }

    /// Swap in a fresh client and event loop; on failure the next poll retries
    async fn apply_new_connection(&self, current_event_loop: &mut Arc<Mutex<EventLoop>>) {
        match MqttClient::create_connection(&self.client_id, &self.config, self.credentials.as_ref())
        {
            Ok((new_client, new_event_loop)) => {
                *current_event_loop = Arc::new(Mutex::new(new_event_loop));
                let mut client_guard = self.shared_client.lock().await;
                *client_guard = new_client;
            }
            Err(e) => error!(error = %e, "Failed to create new connection"),
        }
    }
}

/// Sleep unless shutdown is signalled first; returns false when interrupted
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        MqttClient::publish(self, topic, payload, retain).await
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, topic).await
    }

    async fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        MqttClient::set_message_sender(self, sender).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }

    fn is_permanently_disconnected(&self) -> bool {
        MqttClient::is_permanently_disconnected(self)
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        if let Ok(mut slot) = self.event_loop_handle.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            namespace_topics: true,
            max_reconnect_attempts: None,
        }
    }

    #[test]
    fn test_setup_connection_channels() {
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            MqttClient::setup_connection_channels();

        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);
        assert!(!(*shutdown_rx.borrow()));

        state_tx.send(ConnectionState::Connected).unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);

        shutdown_tx.send(true).unwrap();
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(10)).await;
        drop(state_tx);

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("ConnAck"), "got: {err_msg}");
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_disconnected() {
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Disconnected("bad credentials".to_string()));
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.unwrap_err().to_string().contains("bad credentials"));
    }

    #[tokio::test]
    async fn test_interruptible_sleep() {
        let ((_, _), (_, shutdown_rx)) = MqttClient::setup_connection_channels();
        assert!(interruptible_sleep(shutdown_rx, 10).await);

        let ((_, _), (shutdown_tx, shutdown_rx)) = MqttClient::setup_connection_channels();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });
        assert!(!interruptible_sleep(shutdown_rx, 10_000).await);
    }

    #[tokio::test]
    async fn test_state_before_connect() {
        let client = MqttClient::new("device-state", test_config(), None).unwrap();

        assert!(client.connection_state().is_none());
        assert!(!client.is_permanently_disconnected());
        assert!(!Transport::is_connected(&client));
    }

    #[tokio::test]
    async fn test_publish_fails_without_connection() {
        let client = MqttClient::new("device-publish", test_config(), None).unwrap();

        let result = client.publish("/apt/repos/list", b"[]".to_vec(), false).await;
        assert!(matches!(result, Err(MqttError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_is_tracked() {
        let client = MqttClient::new("device-sub", test_config(), None).unwrap();

        client.subscribe("/apt/repos/list/post").await.unwrap();
        client.subscribe("/apt/repos/list/post").await.unwrap();
        client.subscribe("device-sub/apt/repos/list/post").await.unwrap();

        assert_eq!(
            client.subscribed_topics().await,
            vec![
                "/apt/repos/list/post".to_string(),
                "device-sub/apt/repos/list/post".to_string()
            ]
        );
    }

    /// Queue requests until the rumqttc channel is full; nothing polls it
    async fn fill_request_channel(client: &MqttClient) {
        let raw = client.client.lock().await;
        for n in 0..REQUEST_CHANNEL_CAPACITY {
            raw.try_publish(format!("/fill/{n}"), MessageHandler::qos(), false, Vec::<u8>::new())
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_does_not_block_on_full_request_channel() {
        let client = MqttClient::new("device-resub", test_config(), None).unwrap();
        for n in 0..12 {
            client.subscribe(&format!("/cap{n}/post")).await.unwrap();
        }
        fill_request_channel(&client).await;

        let (state_tx, _state_rx) = watch::channel(ConnectionState::Connected);
        let session = SessionContext {
            client_id: client.client_id.clone(),
            config: client.config.clone(),
            credentials: None,
            shared_client: client.client.clone(),
            reconnect_config: ReconnectConfig::default(),
            subscribed_topics: client.subscribed_topics.clone(),
            message_forwarder: client.message_forwarder.clone(),
            state_tx,
        };

        tokio::time::timeout(Duration::from_secs(1), session.resubscribe_to_topics())
            .await
            .expect("resubscribe returns while the request channel is full");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_returns_when_request_channel_stays_full() {
        let client = MqttClient::new("device-full", test_config(), None).unwrap();
        fill_request_channel(&client).await;

        let result = tokio::time::timeout(
            SUPERVISOR_SHUTDOWN_GRACE * 3,
            client.disconnect(),
        )
        .await
        .expect("disconnect does not hang");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let client = MqttClient::new("device-disc", test_config(), None).unwrap();
        assert!(client.disconnect().await.is_ok());
    }

    #[test]
    fn test_zero_reconnect_attempts_rejected_at_construction() {
        let mut config = test_config();
        config.max_reconnect_attempts = Some(0);
        assert!(matches!(
            MqttClient::new("device-zero", config, None),
            Err(MqttError::InvalidReconnectConfig(_))
        ));

        let mut config = test_config();
        config.max_reconnect_attempts = Some(2);
        let client = MqttClient::new("device-two", config, None).unwrap();
        assert_eq!(client.reconnect_config.max_attempts, Some(2));
    }

    #[test]
    fn test_invalid_broker_rejected_at_construction() {
        let mut config = test_config();
        config.broker_url = "not a url".to_string();
        assert!(matches!(
            MqttClient::new("device-bad", config, None),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
    }
}

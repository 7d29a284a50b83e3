//! Reconnection policy and connection state transitions
//!
//! Pure decisions taken by the session's event-loop supervisor.

use super::connection::ConnectionState;
use crate::config::MqttSection;
use std::time::Duration;
use tracing::{error, info, warn};

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay used once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Default backoff with the attempt limit taken from `[mqtt]`
    pub fn from_section(section: &MqttSection) -> Self {
        Self {
            max_attempts: section.max_reconnect_attempts,
            ..Self::default()
        }
    }

    /// Total delay across all attempts, or None when retries are unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Delay before a 1-based attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }
        if self.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Pure reconnection and state-transition decisions
pub struct ConnectionSupervisor;

impl ConnectionSupervisor {
    /// Decide whether to try again after a connection failure
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// How long `connect` waits for the first CONNACK
    pub fn calculate_connection_timeout(config: &ReconnectConfig) -> Duration {
        match config.calculate_max_total_time() {
            Some(max_total_time) => Duration::from_millis(max_total_time + 30_000),
            None => Duration::from_secs(60),
        }
    }

    /// State after a connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Publishing and subscribing both need an acknowledged session
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "MQTT connection lost");
            }
            (ConnectionState::Disconnected(_), ConnectionState::Reconnecting(attempt)) => {
                info!(attempt, "Starting reconnection attempt");
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!("Reconnection successful");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "MQTT connection permanently failed");
            }
            _ => {}
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}

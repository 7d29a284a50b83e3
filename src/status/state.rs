//! Process-wide agent state and the intents that change it

use crate::config::AgentConfig;
use crate::handlers::apt_repositories::AptRepository;
use crate::transport::mqtt::ConnectionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Broker session as last reported to the state owner
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected { reason: Option<String> },
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    PermanentlyDisconnected { reason: String },
}

impl From<&ConnectionState> for SessionStatus {
    fn from(state: &ConnectionState) -> Self {
        match state {
            ConnectionState::Connecting => SessionStatus::Connecting,
            ConnectionState::Connected => SessionStatus::Connected,
            ConnectionState::Disconnected(reason) => SessionStatus::Disconnected {
                reason: Some(reason.clone()),
            },
            ConnectionState::Reconnecting(attempt) => SessionStatus::Reconnecting {
                attempt: *attempt,
            },
            ConnectionState::PermanentlyDisconnected(reason) => {
                SessionStatus::PermanentlyDisconnected {
                    reason: reason.clone(),
                }
            }
        }
    }
}

/// Bookkeeping for a command whose handler has not returned yet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InFlightCommand {
    pub id: Uuid,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Value>,
    pub started_at: DateTime<Utc>,
}

/// A requested change to [`AgentState`]
///
/// Handlers return intents; only the state owner applies them.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusIntent {
    SessionChanged(SessionStatus),
    CommandStarted {
        id: Uuid,
        topic: String,
        correlation_id: Option<Value>,
    },
    CommandFinished {
        id: Uuid,
        success: bool,
    },
    RepositoriesListed(Vec<AptRepository>),
}

/// Agent state owned by a single writer
#[derive(Debug, Clone)]
pub struct AgentState {
    pub agent_id: String,
    pub config: Arc<AgentConfig>,
    pub session: SessionStatus,
    /// Last repository listing produced by `/apt/repos/list`
    pub repositories: Option<Vec<AptRepository>>,
    pub in_flight: BTreeMap<Uuid, InFlightCommand>,
    pub commands_completed: u64,
    pub commands_failed: u64,
    pub started_at: DateTime<Utc>,
}

impl AgentState {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        Self {
            agent_id: config.agent.id.clone(),
            config,
            session: SessionStatus::Disconnected { reason: None },
            repositories: None,
            in_flight: BTreeMap::new(),
            commands_completed: 0,
            commands_failed: 0,
            started_at: Utc::now(),
        }
    }

    /// Apply one intent
    pub fn apply(&mut self, intent: StatusIntent) {
        match intent {
            StatusIntent::SessionChanged(session) => self.session = session,
            StatusIntent::CommandStarted {
                id,
                topic,
                correlation_id,
            } => {
                self.in_flight.insert(
                    id,
                    InFlightCommand {
                        id,
                        topic,
                        correlation_id,
                        started_at: Utc::now(),
                    },
                );
            }
            StatusIntent::CommandFinished { id, success } => {
                // Unknown ids still count; the start intent may have been dropped
                self.in_flight.remove(&id);
                if success {
                    self.commands_completed += 1;
                } else {
                    self.commands_failed += 1;
                }
            }
            StatusIntent::RepositoriesListed(repositories) => {
                self.repositories = Some(repositories);
            }
        }
    }

    /// Serializable summary published by the `/agent/status` capability
    pub fn snapshot(&self) -> StatusSnapshot {
        let uptime = Utc::now().signed_duration_since(self.started_at);
        StatusSnapshot {
            agent_id: self.agent_id.clone(),
            description: self.config.agent.description.clone(),
            session: self.session.clone(),
            in_flight: self.in_flight.values().cloned().collect(),
            commands_completed: self.commands_completed,
            commands_failed: self.commands_failed,
            repository_count: self.repositories.as_ref().map(Vec::len),
            uptime_secs: uptime.num_seconds().max(0) as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub agent_id: String,
    pub description: String,
    pub session: SessionStatus,
    pub in_flight: Vec<InFlightCommand>,
    pub commands_completed: u64,
    pub commands_failed: u64,
    pub repository_count: Option<usize>,
    pub uptime_secs: u64,
}

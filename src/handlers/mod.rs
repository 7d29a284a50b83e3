//! Command handlers shipped with the agent

pub mod apt_repositories;
pub mod status;

pub use apt_repositories::{AptRepository, AptRepositoryListHandler, APT_REPOS_LIST_TOPIC};
pub use status::{AgentStatusHandler, AGENT_STATUS_TOPIC};

use crate::config::AgentConfig;
use crate::dispatch::{InvocationMode, RegistryError, TopicRegistry};
use std::sync::Arc;

/// Register every shipped capability
pub fn register_default_handlers(
    registry: &mut TopicRegistry,
    config: &AgentConfig,
) -> Result<(), RegistryError> {
    registry.register(
        APT_REPOS_LIST_TOPIC,
        Arc::new(AptRepositoryListHandler::new(config.apt.sources_dir.clone())),
        false,
        InvocationMode::Concurrent,
    )?;
    registry.register(
        AGENT_STATUS_TOPIC,
        Arc::new(AgentStatusHandler),
        false,
        InvocationMode::Concurrent,
    )?;
    Ok(())
}

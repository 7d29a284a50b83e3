//! Agent configuration loaded from TOML
//!
//! The file carries the device identity, the identity provider used for the
//! device authorization grant, the broker connection and the locations the
//! shipped command handlers read from.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main agent configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub agent: AgentSection,
    /// Identity provider; when absent the broker session is opened without a bearer credential
    pub auth: Option<AuthSection>,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub apt: AptSection,
}

/// Agent section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// Device identifier (must match [a-zA-Z0-9._-]+), also used as MQTT client id
    pub id: String,
    /// Free-form description reported by the status capability
    #[serde(default)]
    pub description: String,
}

/// Identity provider section for the OAuth 2.0 device authorization grant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    /// Provider base URL; `/oauth/device/code` and `/oauth/token` are appended
    pub base_url: String,
    /// OAuth client identifier registered for this device class
    pub client_id: String,
    /// API audience the issued token is scoped to
    pub audience: String,
    /// Per-request HTTP timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl AuthSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_request_timeout() -> u64 {
    30
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username (used when no bearer credential is present)
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Also serve every capability under this device's client-id subspace
    #[serde(default = "default_namespace_topics")]
    pub namespace_topics: bool,
    /// Give up after this many consecutive reconnect attempts (unset = retry forever)
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
}

fn default_namespace_topics() -> bool {
    true
}

/// Locations read by the APT repository capability
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AptSection {
    /// Directory holding `sources.list` and `sources.list.d/`
    #[serde(default = "default_sources_dir")]
    pub sources_dir: PathBuf,
}

impl Default for AptSection {
    fn default() -> Self {
        Self {
            sources_dir: default_sources_dir(),
        }
    }
}

fn default_sources_dir() -> PathBuf {
    PathBuf::from("/etc/apt")
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("No configuration file found; pass -c/--config or create one of: {0}")]
    NotFound(String),
    #[error("Invalid agent ID format: {0}")]
    InvalidAgentId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_agent_id(&self.agent.id)?;

        if let Some(auth) = &self.auth {
            if auth.client_id.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "[auth] client_id must not be empty".to_string(),
                ));
            }
            url::Url::parse(&auth.base_url).map_err(|e| {
                ConfigError::InvalidConfig(format!("[auth] base_url '{}': {e}", auth.base_url))
            })?;
        }

        Ok(())
    }

    /// Namespace prefix applied to capability topics, if enabled
    pub fn topic_namespace(&self) -> Option<&str> {
        self.mqtt
            .namespace_topics
            .then_some(self.agent.id.as_str())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[agent]
id = "test-device"
description = "A test device"

[mqtt]
broker_url = "mqtt://localhost:1883"
namespace_topics = false
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Validate agent ID format
fn validate_agent_id(agent_id: &str) -> Result<(), ConfigError> {
    let valid_chars = agent_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if agent_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidAgentId(format!(
            "Agent ID '{agent_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

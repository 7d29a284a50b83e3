//! Connection state, credentials and option construction for the MQTT session
//!
//! Everything here is pure so the broker-facing parts of [`super::MqttClient`]
//! can be tested without a broker.

use crate::auth::Credential;
use crate::config::MqttSection;
use crate::protocol::{PresenceMessage, PresenceStatus, presence_topic};
use rumqttc::Transport as RumqttcTransport;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{MqttOptions, mqttbytes::QoS};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Keep-alive interval negotiated with the broker
pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Largest packet accepted in either direction
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Connection state for the MQTT session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state, attempting to connect
    Connecting,
    /// Broker acknowledged the session
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Reconnection attempts exhausted
    PermanentlyDisconnected(String),
}

/// Username and password presented in the CONNECT packet
#[derive(Clone, PartialEq)]
pub struct SessionCredentials {
    pub username: String,
    pub password: String,
}

impl SessionCredentials {
    /// Bearer session: the client id is the username and the access token the password
    pub fn bearer(client_id: &str, credential: Credential) -> Self {
        Self {
            username: client_id.to_string(),
            password: credential.into_access_token(),
        }
    }

    /// Static credentials read from the environment variables named in the config
    pub fn from_env(config: &MqttSection) -> Option<Self> {
        let username = std::env::var(config.username_env.as_ref()?).ok()?;
        let password = config
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default();
        Some(Self { username, password })
    }

    /// Bearer credential wins over environment credentials
    pub fn resolve(
        client_id: &str,
        config: &MqttSection,
        credential: Option<Credential>,
    ) -> Option<Self> {
        match credential {
            Some(credential) => Some(Self::bearer(client_id, credential)),
            None => Self::from_env(config),
        }
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// MQTT session errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionRejected(String),
    #[error("Invalid reconnect policy: {0}")]
    InvalidReconnectConfig(String),
}

/// Broker endpoint extracted from the configured URL
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://host[:port]` or `mqtts://host[:port]`
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerEndpoint, MqttError> {
    let url = Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.into()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(MqttError::InvalidBrokerUrl(broker_url.into())),
    };
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.into()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Serialized presence for `<client id>/status`
pub fn presence_payload(status: PresenceStatus) -> Result<Vec<u8>, MqttError> {
    serde_json::to_vec(&PresenceMessage::now(status)).map_err(MqttError::SerializationError)
}

/// Retained offline presence registered as the session's last will
pub fn offline_last_will(client_id: &str) -> Result<LastWill, MqttError> {
    let payload = presence_payload(PresenceStatus::Offline)?;
    Ok(LastWill::new(
        presence_topic(client_id),
        payload,
        QoS::AtLeastOnce,
        true,
        None,
    ))
}

/// Build the rumqttc options for one session
pub fn configure_mqtt_options(
    client_id: &str,
    config: &MqttSection,
    credentials: Option<&SessionCredentials>,
) -> Result<MqttOptions, MqttError> {
    let endpoint = parse_broker_url(&config.broker_url)?;
    let mut mqtt_options = MqttOptions::new(client_id, endpoint.host, endpoint.port);

    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    mqtt_options.set_keep_alive(KEEP_ALIVE);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));
    mqtt_options.set_last_will(offline_last_will(client_id)?);

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mqtt_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            namespace_topics: true,
            max_reconnect_attempts: None,
        }
    }

    #[test]
    fn test_parse_broker_url() {
        let endpoint = parse_broker_url("mqtt://broker.local:1884").unwrap();
        assert_eq!(endpoint.host, "broker.local");
        assert_eq!(endpoint.port, 1884);
        assert!(!endpoint.tls);

        let endpoint = parse_broker_url("mqtts://broker.local").unwrap();
        assert_eq!(endpoint.port, 8883);
        assert!(endpoint.tls);

        let endpoint = parse_broker_url("mqtt://broker.local").unwrap();
        assert_eq!(endpoint.port, 1883);
    }

    #[test]
    fn test_invalid_broker_url() {
        for url in ["invalid-url", "http://broker.local", "mqtt://"] {
            assert!(
                matches!(parse_broker_url(url), Err(MqttError::InvalidBrokerUrl(_))),
                "{url} should be rejected"
            );
        }

        let mut config = test_mqtt_config();
        config.broker_url = "invalid-url".to_string();
        let result = configure_mqtt_options("device-01", &config, None);
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = test_mqtt_config();
        let credentials = SessionCredentials {
            username: "device-01".to_string(),
            password: "token".to_string(),
        };
        let options = configure_mqtt_options("device-01", &config, Some(&credentials)).unwrap();

        assert_eq!(options.client_id(), "device-01");
        assert_eq!(options.keep_alive(), KEEP_ALIVE);
    }

    #[test]
    fn test_presence_payload() {
        let payload: serde_json::Value =
            serde_json::from_slice(&presence_payload(PresenceStatus::Offline).unwrap()).unwrap();
        assert_eq!(payload["status"], "offline");
        assert!(offline_last_will("device-01").is_ok());
    }

    #[test]
    fn test_bearer_credentials_take_precedence() {
        let credential = Credential::new("access-123", 3600, "Bearer");
        let resolved = SessionCredentials::resolve("device-01", &test_mqtt_config(), Some(credential))
            .expect("bearer credentials");
        assert_eq!(resolved.username, "device-01");
        assert_eq!(resolved.password, "access-123");
    }

    #[test]
    fn test_env_credentials() {
        let mut config = test_mqtt_config();
        config.username_env = Some("CONNECTOR_TEST_MQTT_USER_CONN".to_string());
        config.password_env = Some("CONNECTOR_TEST_MQTT_PASS_CONN".to_string());
        std::env::set_var("CONNECTOR_TEST_MQTT_USER_CONN", "user");
        std::env::set_var("CONNECTOR_TEST_MQTT_PASS_CONN", "pass");

        let resolved = SessionCredentials::resolve("device-01", &config, None).unwrap();
        assert_eq!(resolved.username, "user");
        assert_eq!(resolved.password, "pass");

        assert!(SessionCredentials::resolve("device-01", &test_mqtt_config(), None).is_none());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = SessionCredentials {
            username: "device-01".to_string(),
            password: "super-secret".to_string(),
        };
        let debug = format!("{credentials:?}");
        assert!(debug.contains("device-01"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn test_connection_state_equality() {
        assert_eq!(ConnectionState::Connected, ConnectionState::Connected);
        assert_ne!(
            ConnectionState::Connected,
            ConnectionState::Disconnected("test".to_string())
        );
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::ConnectionFailed("test".to_string().into()),
            MqttError::PublishFailed("test".to_string().into()),
            MqttError::SubscriptionFailed("test".to_string().into()),
            MqttError::InvalidBrokerUrl("test".to_string()),
            MqttError::NotConnected {
                state: ConnectionState::Disconnected("test".to_string()),
            },
            MqttError::ConnectionRejected("test".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}

//! MQTT session for the connector agent
//!
//! Pure logic is kept apart from I/O so it can be tested without a broker:
//!
//! - [`connection`] - connection state, credentials and option construction
//! - [`message_handler`] - event routing and inbound forwarding
//! - [`supervisor`] - reconnection decisions and state transitions
//! - [`client`] - the rumqttc-backed session itself
//!
//! # Usage
//!
//! ```rust,no_run
//! use connector_agent::transport::mqtt::MqttClient;
//! use connector_agent::transport::Transport;
//! use connector_agent::config::MqttSection;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     namespace_topics: true,
//!     max_reconnect_attempts: None,
//! };
//!
//! let mut client = MqttClient::new("device-01", config, None)?;
//! client.connect().await?;
//! client.subscribe("/apt/repos/list/post").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod supervisor;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError, SessionCredentials};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
pub use supervisor::{ConnectionEvent, ConnectionSupervisor, ReconnectConfig, ReconnectionDecision};

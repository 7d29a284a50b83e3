//! Send one command to a capability and print the response
//!
//! ## Usage
//!
//! ```bash
//! # List APT repositories on every device serving the plain topic
//! send-command --base /apt/repos/list
//!
//! # Address one device through its client-id subspace
//! send-command --base device-01/agent/status --payload '{"id": 7}'
//!
//! # Authenticated broker
//! MQTT_USERNAME=ops MQTT_PASSWORD=secret send-command \
//!   --broker-url mqtts://broker.example.com:8883 \
//!   --username-env MQTT_USERNAME --password-env MQTT_PASSWORD \
//!   --base /apt/repos/list --timeout-secs 30
//! ```

use clap::Parser;
use connector_agent::config::MqttSection;
use connector_agent::dispatch::{CommandRequester, RequestError};
use connector_agent::transport::mqtt::MqttClient;
use serde_json::Value;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "send-command",
    about = "Publish a command on <base>/post and wait for the answer on <base>"
)]
struct Args {
    /// Capability base topic, e.g. /apt/repos/list
    #[arg(long)]
    base: String,

    /// JSON object sent as the request body
    #[arg(long, default_value = "{}")]
    payload: String,

    /// MQTT broker URL
    #[arg(long, default_value = "mqtt://localhost:1883")]
    broker_url: String,

    /// Seconds to wait for the response
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Client id for this session (generated when omitted)
    #[arg(long)]
    client_id: Option<String>,

    /// Environment variable holding the broker username
    #[arg(long)]
    username_env: Option<String>,

    /// Environment variable holding the broker password
    #[arg(long)]
    password_env: Option<String>,
}

async fn send(args: Args) -> Result<Value, Box<dyn std::error::Error>> {
    let payload: Value = serde_json::from_str(&args.payload)?;
    let client_id = args
        .client_id
        .unwrap_or_else(|| format!("send-command-{}", Uuid::new_v4().simple()));

    let mqtt = MqttSection {
        broker_url: args.broker_url,
        username_env: args.username_env,
        password_env: args.password_env,
        namespace_topics: false,
        max_reconnect_attempts: Some(3),
    };

    let mut client = MqttClient::new(&client_id, mqtt, None)?;
    client.connect().await?;
    let client = Arc::new(client);

    let requester = CommandRequester::new(client.clone()).await;
    let result = requester
        .request(&args.base, &payload, Duration::from_secs(args.timeout_secs))
        .await;

    if let Err(e) = client.disconnect().await {
        eprintln!("warning: disconnect failed: {e}");
    }

    Ok(result?)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match send(args).await {
        Ok(response) => match serde_json::to_string_pretty(&response) {
            Ok(text) => println!("{text}"),
            Err(_) => println!("{response}"),
        },
        Err(e) => {
            eprintln!("error: {e}");
            let code = match e.downcast_ref::<RequestError>() {
                Some(RequestError::Timeout { .. }) => 2,
                Some(RequestError::Remote(_)) => 3,
                _ => 1,
            };
            process::exit(code);
        }
    }
}

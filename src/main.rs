//! Connector agent entry point
//!
//! Loads configuration, runs the device authorization grant when an identity
//! provider is configured, then serves capabilities over MQTT until a signal
//! or a permanent disconnect stops it.

use connector_agent::agent::AgentLifecycle;
use connector_agent::auth::{authorize_device, Credential, DeviceAuthenticator};
use connector_agent::config::{AgentConfig, ConfigError};
use connector_agent::error::{AgentError, AgentResult};
use connector_agent::observability::init_default_logging;
use connector_agent::transport::mqtt::MqttClient;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn, Instrument};

const DEFAULT_CONFIG_PATHS: &[&str] = &["agent.toml", "config/agent.toml"];

/// Device control agent
#[derive(Parser)]
#[command(name = "connector-agent")]
#[command(about = "Device authorization plus an MQTT command dispatcher")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CONNECTOR_AGENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize the device and serve commands
    Run,
    /// Run the device authorization grant only and report the result
    Login,
    /// Validate configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    info!("Starting connector agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config).await,
        Commands::Login => login(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> AgentResult<AgentConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AgentConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AgentConfig::load_from_file(path)?);
        }
    }

    Err(ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", ")).into())
}

/// Flip the returned receiver to true on SIGINT or SIGTERM
fn shutdown_signal() -> AgentResult<watch::Receiver<bool>> {
    let install = |kind| {
        signal(kind)
            .map_err(|e| AgentError::internal_error(format!("Failed to install signal handler: {e}")))
    };
    let mut sigint = install(SignalKind::interrupt())?;
    let mut sigterm = install(SignalKind::terminate())?;
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
        let _ = tx.send(true);
    });

    Ok(rx)
}

/// Device authorization when `[auth]` is configured; None means an anonymous session
async fn obtain_credential(
    config: &AgentConfig,
    shutdown: watch::Receiver<bool>,
) -> AgentResult<Option<Credential>> {
    let Some(auth) = &config.auth else {
        info!("No [auth] section - connecting without a bearer credential");
        return Ok(None);
    };

    let span = connector_agent::auth_span!(client_id = %auth.client_id, audience = %auth.audience);
    async {
        let authenticator = DeviceAuthenticator::from_config(auth)?;
        let credential =
            authorize_device(&authenticator, &auth.client_id, &auth.audience, shutdown).await?;
        info!(
            token_type = %credential.token_type,
            expires_at = %credential.expires_at(),
            "Device authorized"
        );
        Ok::<_, AgentError>(Some(credential))
    }
    .instrument(span)
    .await
}

async fn login(config: AgentConfig) -> AgentResult<()> {
    if config.auth.is_none() {
        return Err(ConfigError::InvalidConfig("configuration has no [auth] section".into()).into());
    }
    let shutdown = shutdown_signal()?;
    obtain_credential(&config, shutdown).await?;
    Ok(())
}

async fn run_agent(config: AgentConfig) -> AgentResult<()> {
    info!("Application starting with agent ID: {}", config.agent.id);
    let mut shutdown = shutdown_signal()?;

    let credential = obtain_credential(&config, shutdown.clone()).await?;
    if *shutdown.borrow() {
        return Ok(());
    }

    let transport = MqttClient::new(&config.agent.id, config.mqtt.clone(), credential)
        .map_err(AgentError::transport)?;
    let mut agent = AgentLifecycle::new(config, transport);
    agent.start().await?;

    info!("Agent is running and waiting for commands on MQTT...");

    tokio::select! {
        _ = shutdown.wait_for(|stop| *stop) => {}
        _ = monitor_connection_health(&agent) => {
            error!("MQTT connection permanently lost, shutting down agent...");
        }
    }

    info!("Application shutdown initiated");
    agent.shutdown().await?;
    Ok(())
}

fn handle_config_command(config: &AgentConfig, show: bool) -> AgentResult<()> {
    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| AgentError::internal_error(format!("Failed to render configuration: {e}")))?;
        println!("{rendered}");
    }
    if config.auth.is_none() {
        warn!("No [auth] section: the broker session will not carry a bearer credential");
    }

    info!("Configuration validation complete");
    Ok(())
}

/// Resolve once the session has given up reconnecting
async fn monitor_connection_health<T>(agent: &AgentLifecycle<T>)
where
    T: connector_agent::transport::Transport,
{
    loop {
        if agent.is_permanently_disconnected() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

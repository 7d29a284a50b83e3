//! Subscriber setup and span macros
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE (default INFO)
//! - `LOG_FORMAT`: `json`, `pretty` or `compact` (default json)
//! - `LOG_SPANS`: emit span open/close events when `true`
//! - `RUST_LOG`: full filter override in `EnvFilter` syntax
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG connector-agent run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are capped at `warn` unless `RUST_LOG` says otherwise
const QUIET_TARGETS: &[&str] = &["rumqttc", "hyper", "hyper_util", "reqwest", "rustls"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Multi-line, colored
    Pretty,
    /// Single line, colored
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Resolved logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
    pub filter_override: Option<String>,
}

impl LoggingSettings {
    /// Build settings from a variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let level = match lookup("LOG_LEVEL")
            .unwrap_or_default()
            .to_uppercase()
            .as_str()
        {
            "ERROR" => Level::ERROR,
            "WARN" => Level::WARN,
            "DEBUG" => Level::DEBUG,
            "TRACE" => Level::TRACE,
            _ => Level::INFO,
        };

        Self {
            level,
            format: LogFormat::parse(&lookup("LOG_FORMAT").unwrap_or_default()),
            include_spans: lookup("LOG_SPANS").is_some_and(|v| v.eq_ignore_ascii_case("true")),
            filter_override: lookup("RUST_LOG").filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Filter for these settings; `RUST_LOG` replaces the default directives
    pub fn filter(&self) -> EnvFilter {
        if let Some(directives) = &self.filter_override {
            return EnvFilter::new(directives);
        }

        QUIET_TARGETS
            .iter()
            .filter_map(|target| format!("{target}=warn").parse::<Directive>().ok())
            .fold(EnvFilter::new(self.level.to_string()), |filter, directive| {
                filter.add_directive(directive)
            })
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber
///
/// A second call is a no-op so tests and binaries can both call it.
pub fn init_logging(settings: &LoggingSettings) {
    let subscriber = tracing_subscriber::registry().with(settings.filter());

    let result = match settings.format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_events(settings.span_events()),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(settings.span_events()),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(settings.span_events()),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    init_logging(&LoggingSettings::from_env());
}

/// Span around one command invocation
#[macro_export]
macro_rules! command_span {
    ($handler:expr, $topic:expr) => {
        tracing::info_span!("command", handler = %$handler, topic = %$topic)
    };
    ($handler:expr, $topic:expr, $($field:tt)*) => {
        tracing::info_span!("command", handler = %$handler, topic = %$topic, $($field)*)
    };
}

/// Span around the device authorization flow
#[macro_export]
macro_rules! auth_span {
    ($($field:tt)*) => {
        tracing::info_span!("device_auth", $($field)*)
    };
}

/// Span around an MQTT session operation
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_session", $($field)*)
    };
}

/// Span around startup and shutdown
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle", $($field)*)
    };
}

pub use {auth_span, command_span, lifecycle_span, mqtt_span};

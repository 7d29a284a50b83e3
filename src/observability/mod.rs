//! Structured logging for the agent
//!
//! Everything the agent reports goes through `tracing`; this module owns the
//! subscriber setup and the span macros used at the main seams.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat, LoggingSettings};

pub use logging::{auth_span, command_span, lifecycle_span, mqtt_span};

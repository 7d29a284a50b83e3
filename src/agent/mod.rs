//! Agent lifecycle
//!
//! Wires the session, the status owner, the topic registry and the
//! dispatcher together and tears them down again in reverse order.

pub mod lifecycle;

pub use lifecycle::{AgentLifecycle, LifecycleError, SESSION_WATCH_INTERVAL};

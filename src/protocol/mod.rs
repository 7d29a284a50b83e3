//! Wire-level conventions shared by the dispatcher and the session
//!
//! Topic naming for capabilities and the payload shapes the agent publishes
//! on its own behalf (errors and presence).

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;

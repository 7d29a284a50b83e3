//! Agent status: process-wide state with a single writer
//!
//! Handlers only ever see a [`StatusView`]; changes travel as
//! [`StatusIntent`]s to the [`StatusOwner`] task.

pub mod owner;
pub mod state;

pub use owner::{StatusHandle, StatusOwner, StatusView};
pub use state::{AgentState, InFlightCommand, SessionStatus, StatusIntent, StatusSnapshot};

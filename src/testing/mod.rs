//! Testing utilities and mock implementations
//!
//! Lets the dispatcher and the authenticator run without a broker or an
//! identity provider.

pub mod mocks;

pub use mocks::*;

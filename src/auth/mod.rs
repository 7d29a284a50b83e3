//! OAuth 2.0 Device Authorization Grant
//!
//! - [`http`] - injectable HTTP transport shim
//! - [`device`] - single-shot provider calls (start, check)
//! - [`poller`] - caller-owned polling loop and its state machine

pub mod device;
pub mod error;
pub mod http;
pub mod poller;

pub use device::{Credential, DeviceAuthenticator, DeviceCode};
pub use error::AuthError;
pub use http::{HttpClient, HttpError, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use poller::{authorize_device, poll_for_token, PollFailure, PollOutcome, PollState};

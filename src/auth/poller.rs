//! Caller-owned polling loop for the device authorization grant
//!
//! ```text
//! PENDING --pending-->   PENDING
//! PENDING --slow_down--> PENDING (interval += 5s)
//! PENDING --success-->   AUTHORIZED
//! PENDING --denied | expired | elapsed | rejected--> FAILED
//! ```
//!
//! The loop runs as its own task, holds no locks while sleeping and honours a
//! stop signal in the middle of a wait.

use super::device::{Credential, DeviceAuthenticator, DeviceCode};
use super::error::AuthError;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Interval increase requested by a `slow_down` reply
pub const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

/// Interval used when the provider does not announce one
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Classified result of a single poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Authorized,
    Pending,
    SlowDown,
    Denied,
    Expired,
    /// Network failure; retried on the next tick
    TransportFailure,
    /// Decode failure or unexpected status
    Rejected,
}

impl PollOutcome {
    pub fn classify(result: &Result<Credential, AuthError>) -> Self {
        match result {
            Ok(_) => PollOutcome::Authorized,
            Err(AuthError::SlowDown) => PollOutcome::SlowDown,
            Err(e) if e.is_pending() => PollOutcome::Pending,
            Err(e) if e.is_retryable() => PollOutcome::TransportFailure,
            Err(AuthError::AccessDenied) => PollOutcome::Denied,
            Err(AuthError::ExpiredToken) | Err(AuthError::DeviceCodeExpired { .. }) => {
                PollOutcome::Expired
            }
            Err(_) => PollOutcome::Rejected,
        }
    }
}

/// Why an authorization attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollFailure {
    Denied,
    Expired,
    Elapsed,
    Rejected,
}

/// State of an authorization attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Pending { interval: Duration },
    Authorized,
    Failed(PollFailure),
}

impl PollState {
    /// State immediately after a successful `start_device_auth`
    pub fn initial(device_code: &DeviceCode) -> Self {
        let interval = if device_code.interval == 0 {
            DEFAULT_POLL_INTERVAL
        } else {
            Duration::from_secs(device_code.interval)
        };
        PollState::Pending { interval }
    }

    /// Pure transition on a poll outcome; terminal states absorb everything
    pub fn on_outcome(self, outcome: PollOutcome) -> Self {
        let interval = match self {
            PollState::Pending { interval } => interval,
            terminal => return terminal,
        };

        match outcome {
            PollOutcome::Authorized => PollState::Authorized,
            PollOutcome::Pending | PollOutcome::TransportFailure => PollState::Pending { interval },
            PollOutcome::SlowDown => PollState::Pending {
                interval: interval + SLOW_DOWN_INCREMENT,
            },
            PollOutcome::Denied => PollState::Failed(PollFailure::Denied),
            PollOutcome::Expired => PollState::Failed(PollFailure::Expired),
            PollOutcome::Rejected => PollState::Failed(PollFailure::Rejected),
        }
    }

    /// Transition taken when the device code lifetime has elapsed
    pub fn on_elapsed(self) -> Self {
        match self {
            PollState::Pending { .. } => PollState::Failed(PollFailure::Elapsed),
            terminal => terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollState::Pending { .. })
    }
}

/// Sleep until `deadline`; returns false if the stop signal fired first
async fn interruptible_sleep_until(shutdown: &mut watch::Receiver<bool>, deadline: Instant) -> bool {
    if *shutdown.borrow() {
        return false;
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                match changed {
                    Ok(()) if *shutdown.borrow() => {
                        info!("Stop signal received while waiting to poll");
                        return false;
                    }
                    Ok(()) => continue,
                    Err(_) => {
                        // Sender gone: nobody can stop us any more
                        sleep_until(deadline).await;
                        return true;
                    }
                }
            }
            _ = sleep_until(deadline) => return true,
        }
    }
}

/// Poll the token endpoint until authorized, denied, expired or stopped
///
/// Never issues a request once `expires_in` seconds have elapsed since the
/// device code was issued, however late polling starts.
#[tracing::instrument(name = "poll_for_token", skip_all, fields(client_id = %client_id))]
pub async fn poll_for_token(
    authenticator: &DeviceAuthenticator,
    client_id: &str,
    device_code: &DeviceCode,
    expected_audience: Option<&str>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<Credential, AuthError> {
    let expired = || AuthError::DeviceCodeExpired {
        expires_in: device_code.expires_in,
    };

    let mut state = PollState::initial(device_code);
    let mut attempts = 0u32;

    loop {
        let interval = match state {
            PollState::Pending { interval } => interval,
            _ => return Err(expired()),
        };

        let remaining = device_code.remaining();
        if remaining.is_zero() {
            state = state.on_elapsed();
            warn!(attempts, ?state, "Device code lifetime elapsed");
            return Err(expired());
        }

        let wait = interval.min(remaining);
        if !interruptible_sleep_until(&mut shutdown, Instant::now() + wait).await {
            return Err(AuthError::Cancelled);
        }

        if device_code.remaining().is_zero() {
            state = state.on_elapsed();
            warn!(attempts, ?state, "Device code lifetime elapsed");
            return Err(expired());
        }

        attempts += 1;
        let result = authenticator
            .check_device_auth(client_id, &device_code.device_code, expected_audience)
            .await;
        state = state.on_outcome(PollOutcome::classify(&result));

        match (&state, result) {
            (PollState::Authorized, Ok(credential)) => {
                info!(attempts, "Device authorized");
                return Ok(credential);
            }
            (PollState::Pending { interval }, Err(e)) => {
                debug!(attempts, interval_secs = interval.as_secs(), "Still waiting: {}", e);
            }
            (_, Err(e)) => return Err(e),
            (_, Ok(credential)) => return Ok(credential),
        }
    }
}

/// Run the full flow: request a code, show it to the operator, poll for a token
pub async fn authorize_device(
    authenticator: &DeviceAuthenticator,
    client_id: &str,
    audience: &str,
    shutdown: watch::Receiver<bool>,
) -> Result<Credential, AuthError> {
    let device_code = authenticator.start_device_auth(client_id, audience).await?;

    info!(
        user_code = %device_code.user_code,
        verification_uri = %device_code.verification_uri,
        verification_uri_complete = %device_code.verification_uri_complete,
        expires_in = device_code.expires_in,
        "Authorize this device by visiting the verification URI and entering the user code"
    );

    poll_for_token(authenticator, client_id, &device_code, None, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::http::{HttpError, HttpResponse};
    use crate::testing::MockHttpClient;
    use serde_json::json;
    use std::sync::Arc;

    fn device_code(expires_in: u64, interval: u64) -> DeviceCode {
        DeviceCode {
            device_code: "dev-123".to_string(),
            user_code: "ABCD-EFGH".to_string(),
            verification_uri: "https://idp.example.com/activate".to_string(),
            verification_uri_complete: String::new(),
            expires_in,
            interval,
            issued_at: Instant::now(),
        }
    }

    fn pending() -> HttpResponse {
        HttpResponse::new(403, json!({"error": "authorization_pending"}).to_string())
    }

    fn token() -> HttpResponse {
        HttpResponse::new(
            200,
            json!({"access_token": "tok", "expires_in": 3600, "token_type": "Bearer"}).to_string(),
        )
    }

    #[test]
    fn test_initial_state_uses_provider_interval() {
        assert_eq!(
            PollState::initial(&device_code(60, 3)),
            PollState::Pending {
                interval: Duration::from_secs(3)
            }
        );
        assert_eq!(
            PollState::initial(&device_code(60, 0)),
            PollState::Pending {
                interval: DEFAULT_POLL_INTERVAL
            }
        );
    }

    #[test]
    fn test_state_transitions() {
        let pending = PollState::Pending {
            interval: Duration::from_secs(5),
        };

        assert_eq!(pending.clone().on_outcome(PollOutcome::Pending), pending);
        assert_eq!(
            pending.clone().on_outcome(PollOutcome::SlowDown),
            PollState::Pending {
                interval: Duration::from_secs(10)
            }
        );
        assert_eq!(
            pending.clone().on_outcome(PollOutcome::Authorized),
            PollState::Authorized
        );
        assert_eq!(
            pending.clone().on_outcome(PollOutcome::Denied),
            PollState::Failed(PollFailure::Denied)
        );
        assert_eq!(
            pending.clone().on_outcome(PollOutcome::Expired),
            PollState::Failed(PollFailure::Expired)
        );
        assert_eq!(
            pending.clone().on_outcome(PollOutcome::TransportFailure),
            pending
        );
        assert_eq!(
            pending.clone().on_elapsed(),
            PollState::Failed(PollFailure::Elapsed)
        );
    }

    #[test]
    fn test_classify_maps_error_kinds() {
        let transport: Result<Credential, AuthError> =
            Err(HttpError::Request("connection reset".into()).into());
        assert_eq!(PollOutcome::classify(&transport), PollOutcome::TransportFailure);
        assert_eq!(
            PollOutcome::classify(&Err(AuthError::AuthorizationPending)),
            PollOutcome::Pending
        );
        assert_eq!(
            PollOutcome::classify(&Err(AuthError::SlowDown)),
            PollOutcome::SlowDown
        );
        assert_eq!(
            PollOutcome::classify(&Err(AuthError::AccessDenied)),
            PollOutcome::Denied
        );
        assert_eq!(
            PollOutcome::classify(&Err(AuthError::DeviceCodeExpired { expires_in: 5 })),
            PollOutcome::Expired
        );
        assert_eq!(
            PollOutcome::classify(&Err(AuthError::UnexpectedStatus {
                status: 500,
                body: String::new()
            })),
            PollOutcome::Rejected
        );
        assert_eq!(
            PollOutcome::classify(&Err(AuthError::Cancelled)),
            PollOutcome::Rejected
        );
    }

    #[test]
    fn test_terminal_states_absorb_outcomes() {
        assert_eq!(
            PollState::Authorized.on_outcome(PollOutcome::Denied),
            PollState::Authorized
        );
        let failed = PollState::Failed(PollFailure::Denied);
        assert!(failed.is_terminal());
        assert_eq!(failed.clone().on_outcome(PollOutcome::Authorized), failed);
        assert_eq!(failed.clone().on_elapsed(), failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_polling_after_expiry() {
        let http = Arc::new(MockHttpClient::new(|_| Ok(pending())));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let result =
            poll_for_token(&authenticator, "client", &device_code(10, 3), None, stop_rx).await;

        assert!(matches!(
            result,
            Err(AuthError::DeviceCodeExpired { expires_in: 10 })
        ));
        // Polls at 3s, 6s and 9s; the 12s tick falls past the 10s lifetime.
        assert_eq!(http.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_start_does_not_extend_lifetime() {
        let http = Arc::new(MockHttpClient::new(|_| Ok(pending())));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let code = device_code(10, 3);

        tokio::time::advance(Duration::from_secs(7)).await;
        let started = Instant::now();
        let result = poll_for_token(&authenticator, "client", &code, None, stop_rx).await;

        assert!(matches!(
            result,
            Err(AuthError::DeviceCodeExpired { expires_in: 10 })
        ));
        // Only the 3s left of the lifetime remain: no poll fits after the 3s wait.
        assert_eq!(http.request_count(), 0);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_code_already_expired_is_never_polled() {
        let http = Arc::new(MockHttpClient::new(|_| Ok(pending())));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let code = device_code(10, 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        let result = poll_for_token(&authenticator, "client", &code, None, stop_rx).await;

        assert!(matches!(result, Err(AuthError::DeviceCodeExpired { .. })));
        assert_eq!(http.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_pending_replies() {
        let http = Arc::new(MockHttpClient::sequence(vec![
            Ok(pending()),
            Ok(pending()),
            Ok(token()),
        ]));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let credential =
            poll_for_token(&authenticator, "client", &device_code(60, 1), None, stop_rx)
                .await
                .unwrap();

        assert_eq!(credential.access_token(), "tok");
        assert_eq!(http.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_down_increases_interval() {
        let http = Arc::new(MockHttpClient::sequence(vec![
            Ok(HttpResponse::new(429, json!({"error": "slow_down"}).to_string())),
            Ok(token()),
        ]));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let started = Instant::now();

        poll_for_token(&authenticator, "client", &device_code(60, 1), None, stop_rx)
            .await
            .unwrap();

        // 1s before the first poll, then 1s + 5s before the second.
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_stops_immediately() {
        let http = Arc::new(MockHttpClient::new(|_| {
            Ok(HttpResponse::new(403, json!({"error": "access_denied"}).to_string()))
        }));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let result =
            poll_for_token(&authenticator, "client", &device_code(60, 1), None, stop_rx).await;

        assert!(matches!(result, Err(AuthError::AccessDenied)));
        assert_eq!(http.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_stops_immediately() {
        let http = Arc::new(MockHttpClient::new(|_| {
            Ok(HttpResponse::new(400, json!({"error": "expired_token"}).to_string()))
        }));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let result =
            poll_for_token(&authenticator, "client", &device_code(60, 1), None, stop_rx).await;

        assert!(matches!(result, Err(AuthError::ExpiredToken)));
        assert_eq!(http.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_retried() {
        let http = Arc::new(MockHttpClient::sequence(vec![
            Err(HttpError::Request("connection reset".into())),
            Ok(token()),
        ]));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let credential =
            poll_for_token(&authenticator, "client", &device_code(60, 1), None, stop_rx)
                .await
                .unwrap();

        assert_eq!(credential.access_token(), "tok");
        assert_eq!(http.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_status_is_terminal() {
        let http = Arc::new(MockHttpClient::new(|_| Ok(HttpResponse::new(500, "boom"))));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let result =
            poll_for_token(&authenticator, "client", &device_code(60, 1), None, stop_rx).await;

        assert!(matches!(
            result,
            Err(AuthError::UnexpectedStatus { status: 500, .. })
        ));
        assert_eq!(http.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_interrupts_wait() {
        let http = Arc::new(MockHttpClient::new(|_| Ok(pending())));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http.clone());
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let _ = stop_tx.send(true);
        });

        let result =
            poll_for_token(&authenticator, "client", &device_code(600, 30), None, stop_rx).await;

        assert!(matches!(result, Err(AuthError::Cancelled)));
        assert_eq!(http.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authorize_device_runs_full_flow() {
        let code = json!({
            "device_code": "dev-1",
            "user_code": "WXYZ",
            "verification_uri": "https://idp.example.com/activate",
            "verification_uri_complete": "https://idp.example.com/activate?user_code=WXYZ",
            "expires_in": 60,
            "interval": 1
        });
        let http = Arc::new(MockHttpClient::sequence(vec![
            Ok(HttpResponse::new(200, code.to_string())),
            Ok(pending()),
            Ok(token()),
        ]));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let credential = authorize_device(&authenticator, "client", "aud", stop_rx)
            .await
            .unwrap();

        assert_eq!(credential.access_token(), "tok");
        let requests = http.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].path().ends_with("/oauth/device/code"));
        assert!(requests[1].body.contains("device_code=dev-1"));
    }
}

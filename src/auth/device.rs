//! Single-shot calls against the identity provider
//!
//! Each function issues exactly one request. Retrying and pacing belong to the
//! caller, see [`super::poller`].

use super::error::AuthError;
use super::http::{HttpClient, HttpRequest, HttpResponse, ReqwestHttpClient};
use crate::config::AuthSection;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

const DEVICE_CODE_PATH: &str = "/oauth/device/code";
const TOKEN_PATH: &str = "/oauth/token";
const MAX_ERROR_BODY: usize = 200;

/// Bytes that would break form structure; URL punctuation such as `:` and `/` stays literal
const FORM_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'&')
    .add(b'=')
    .add(b'+')
    .add(b'#')
    .add(b'%');

/// Device and user code pair returned when an authorization attempt starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: String,
    /// Seconds until `device_code` is void
    pub expires_in: u64,
    /// Minimum seconds between polls
    #[serde(default)]
    pub interval: u64,
    /// When the provider's reply was decoded; `expires_in` counts from here
    #[serde(skip, default = "Instant::now")]
    pub issued_at: Instant,
}

impl DeviceCode {
    /// Time left before `device_code` is void
    pub fn remaining(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.expires_in).saturating_sub(self.issued_at.elapsed())
    }
}

/// Access token obtained by polling the token endpoint
///
/// Deliberately not `Clone`: it is moved into the broker session.
pub struct Credential {
    access_token: String,
    pub expires_in: u64,
    pub token_type: String,
    pub obtained_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, expires_in: u64, token_type: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in,
            token_type: token_type.into(),
            obtained_at: Utc::now(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn into_access_token(self) -> String {
        self.access_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.obtained_at + chrono::Duration::seconds(self.expires_in as i64)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"***")
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    token_type: String,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    error: String,
}

/// Client for the provider's device-code and token endpoints
pub struct DeviceAuthenticator {
    base_url: String,
    http: Arc<dyn HttpClient>,
}

impl DeviceAuthenticator {
    pub fn new(base_url: impl Into<String>, http: Arc<dyn HttpClient>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, http }
    }

    /// Build an authenticator backed by reqwest from the `[auth]` section
    pub fn from_config(auth: &AuthSection) -> Result<Self, AuthError> {
        let http = ReqwestHttpClient::new(auth.request_timeout())?;
        Ok(Self::new(auth.base_url.clone(), Arc::new(http)))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Request a device/user code pair
    pub async fn start_device_auth(
        &self,
        client_id: &str,
        audience: &str,
    ) -> Result<DeviceCode, AuthError> {
        let request = HttpRequest::post_form(
            self.endpoint(DEVICE_CODE_PATH),
            build_device_code_body(client_id, audience),
        );

        let response = self.http.execute(request).await?;
        if !response.is_success() {
            return Err(unexpected_status(&response));
        }

        serde_json::from_str::<DeviceCode>(&response.body).map_err(|source| AuthError::Decode {
            context: "device code",
            source,
        })
    }

    /// Perform one poll of the token endpoint
    pub async fn check_device_auth(
        &self,
        client_id: &str,
        device_code: &str,
        expected_audience: Option<&str>,
    ) -> Result<Credential, AuthError> {
        let request = HttpRequest::post_form(
            self.endpoint(TOKEN_PATH),
            build_token_body(client_id, device_code, expected_audience),
        );

        let response = self.http.execute(request).await?;
        debug!(status = response.status, "Token endpoint replied");
        classify_token_response(&response)
    }
}

/// `client_id=<id>&audience=<audience>`
pub fn build_device_code_body(client_id: &str, audience: &str) -> String {
    format!(
        "client_id={}&audience={}",
        encode_form_value(client_id),
        encode_form_value(audience)
    )
}

/// `client_id=<id>&grant_type=<device code grant>&device_code=<code>[&audience=<aud>]`
pub fn build_token_body(
    client_id: &str,
    device_code: &str,
    expected_audience: Option<&str>,
) -> String {
    let mut body = format!(
        "client_id={}&grant_type={}&device_code={}",
        encode_form_value(client_id),
        DEVICE_CODE_GRANT_TYPE,
        encode_form_value(device_code)
    );
    if let Some(audience) = expected_audience.filter(|a| !a.is_empty()) {
        body.push_str("&audience=");
        body.push_str(&encode_form_value(audience));
    }
    body
}

/// Percent-encode one form value
pub fn encode_form_value(value: &str) -> String {
    utf8_percent_encode(value, FORM_VALUE).to_string()
}

/// Map a token endpoint reply onto a credential or a distinguishable error kind
pub fn classify_token_response(response: &HttpResponse) -> Result<Credential, AuthError> {
    if response.status == 200 {
        let token: TokenResponse =
            serde_json::from_str(&response.body).map_err(|source| AuthError::Decode {
                context: "token",
                source,
            })?;
        return Ok(Credential::new(
            token.access_token,
            token.expires_in,
            token.token_type,
        ));
    }

    match serde_json::from_str::<ProviderError>(&response.body) {
        Ok(provider) => match provider.error.as_str() {
            "authorization_pending" => Err(AuthError::AuthorizationPending),
            "slow_down" => Err(AuthError::SlowDown),
            "expired_token" => Err(AuthError::ExpiredToken),
            "access_denied" => Err(AuthError::AccessDenied),
            _ => Err(unexpected_status(response)),
        },
        Err(_) => Err(unexpected_status(response)),
    }
}

fn unexpected_status(response: &HttpResponse) -> AuthError {
    let body: String = response.body.chars().take(MAX_ERROR_BODY).collect();
    AuthError::UnexpectedStatus {
        status: response.status,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::http::HttpError;
    use crate::testing::MockHttpClient;
    use serde_json::json;

    fn sample_device_code() -> DeviceCode {
        DeviceCode {
            device_code: "0".to_string(),
            user_code: "test".to_string(),
            verification_uri: "test".to_string(),
            expires_in: 1,
            interval: 1,
            verification_uri_complete: "test11".to_string(),
            issued_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_start_transport_error_returns_no_device_code() {
        let http = Arc::new(MockHttpClient::new(|_| {
            Err(HttpError::Request("wanted error from mock web server".into()))
        }));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http);

        let result = authenticator.start_device_auth("", "0").await;

        assert!(matches!(result, Err(AuthError::Transport(_))));
    }

    #[tokio::test]
    async fn test_start_issues_form_post_and_decodes() {
        let expected = sample_device_code();
        let body = serde_json::to_string(&expected).unwrap();
        let http = Arc::new(MockHttpClient::new(move |_| Ok(HttpResponse::new(200, body.clone()))));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com/", http.clone());

        let device_code = authenticator
            .start_device_auth("client-1", "https://api.example.com")
            .await
            .unwrap();

        assert_eq!(device_code.device_code, expected.device_code);
        assert_eq!(device_code.user_code, expected.user_code);
        assert_eq!(
            device_code.verification_uri_complete,
            expected.verification_uri_complete
        );
        assert_eq!(device_code.expires_in, expected.expires_in);

        let requests = http.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, reqwest::Method::POST);
        assert_eq!(
            request.header_values("content-type"),
            vec!["application/x-www-form-urlencoded"]
        );
        assert!(request.path().contains("/oauth/device/code"));
        assert!(request.body.contains("client_id="));
        assert!(request.body.contains("&audience=https://api.example.com"));
    }

    #[tokio::test]
    async fn test_start_decode_failure_is_distinct() {
        let http = Arc::new(MockHttpClient::new(|_| Ok(HttpResponse::new(200, "not json"))));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http);

        let result = authenticator.start_device_auth("c", "a").await;

        assert!(matches!(result, Err(AuthError::Decode { .. })));
    }

    #[tokio::test]
    async fn test_start_non_success_status() {
        let http = Arc::new(MockHttpClient::new(|_| {
            Ok(HttpResponse::new(401, r#"{"error":"unauthorized_client"}"#))
        }));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http);

        let result = authenticator.start_device_auth("c", "a").await;

        assert!(matches!(
            result,
            Err(AuthError::UnexpectedStatus { status: 401, .. })
        ));
    }

    #[tokio::test]
    async fn test_check_returns_access_token_unchanged() {
        let http = Arc::new(MockHttpClient::new(|_| {
            Ok(HttpResponse::new(
                200,
                json!({"access_token": "asdf", "expires_in": 999, "token_type": "testType"})
                    .to_string(),
            ))
        }));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http.clone());

        let credential = authenticator.check_device_auth("", "0", None).await.unwrap();

        assert_eq!(credential.access_token(), "asdf");
        assert_eq!(credential.expires_in, 999);
        assert_eq!(credential.token_type, "testType");

        let request = &http.requests()[0];
        assert!(request.path().contains("/oauth/token"));
        assert!(request.body.contains("client_id="));
        assert!(request
            .body
            .contains("grant_type=urn:ietf:params:oauth:grant-type:device_code&device_code="));
        assert!(!request.body.contains("audience="));
    }

    #[tokio::test]
    async fn test_check_appends_expected_audience() {
        let http = Arc::new(MockHttpClient::new(|_| {
            Ok(HttpResponse::new(403, r#"{"error":"authorization_pending"}"#))
        }));
        let authenticator = DeviceAuthenticator::new("https://idp.example.com", http.clone());

        let _ = authenticator
            .check_device_auth("c", "dev", Some("https://api.example.com"))
            .await;

        let request = &http.requests()[0];
        assert!(request.body.ends_with("&device_code=dev&audience=https://api.example.com"));
    }

    #[test]
    fn test_classify_provider_error_codes() {
        let cases = vec![
            ("authorization_pending", "pending"),
            ("slow_down", "slow"),
            ("expired_token", "expired"),
            ("access_denied", "denied"),
        ];

        for (code, kind) in cases {
            let response = HttpResponse::new(403, json!({ "error": code }).to_string());
            let result = classify_token_response(&response);
            let matched = match (kind, result) {
                ("pending", Err(AuthError::AuthorizationPending)) => true,
                ("slow", Err(AuthError::SlowDown)) => true,
                ("expired", Err(AuthError::ExpiredToken)) => true,
                ("denied", Err(AuthError::AccessDenied)) => true,
                _ => false,
            };
            assert!(matched, "Unexpected classification for {code}");
        }
    }

    #[test]
    fn test_classify_unknown_error_is_unexpected_status() {
        let response = HttpResponse::new(500, "internal");
        assert!(matches!(
            classify_token_response(&response),
            Err(AuthError::UnexpectedStatus { status: 500, .. })
        ));

        let response = HttpResponse::new(400, r#"{"error":"invalid_grant"}"#);
        assert!(matches!(
            classify_token_response(&response),
            Err(AuthError::UnexpectedStatus { status: 400, .. })
        ));
    }

    #[test]
    fn test_classify_success_with_bad_body_is_decode_error() {
        let response = HttpResponse::new(200, r#"{"token":"missing field"}"#);
        assert!(matches!(
            classify_token_response(&response),
            Err(AuthError::Decode { context: "token", .. })
        ));
    }

    #[test]
    fn test_unexpected_status_body_is_truncated() {
        let response = HttpResponse::new(502, "x".repeat(1000));
        match classify_token_response(&response) {
            Err(AuthError::UnexpectedStatus { body, .. }) => assert_eq!(body.len(), MAX_ERROR_BODY),
            other => panic!("Expected UnexpectedStatus, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_form_value() {
        assert_eq!(encode_form_value("https://api.example.com"), "https://api.example.com");
        assert_eq!(encode_form_value("a b"), "a%20b");
        assert_eq!(encode_form_value("a&b=c"), "a%26b%3Dc");
        assert_eq!(encode_form_value("100%"), "100%25");
        assert_eq!(encode_form_value("é"), "%C3%A9");
        assert_eq!(encode_form_value("a+b#c"), "a%2Bb%23c");
        assert_eq!(encode_form_value("tab\there"), "tab%09here");
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_code_lifetime_counts_from_decode() {
        let code: DeviceCode = serde_json::from_value(json!({
            "device_code": "dev",
            "user_code": "ABCD",
            "verification_uri": "https://idp.example.com/activate",
            "expires_in": 30
        }))
        .unwrap();
        assert_eq!(code.remaining(), std::time::Duration::from_secs(30));

        tokio::time::advance(std::time::Duration::from_secs(12)).await;
        assert_eq!(code.remaining(), std::time::Duration::from_secs(18));

        tokio::time::advance(std::time::Duration::from_secs(60)).await;
        assert_eq!(code.remaining(), std::time::Duration::ZERO);
        assert!(!serde_json::to_string(&code).unwrap().contains("issued_at"));
    }

    #[test]
    fn test_credential_debug_redacts_token() {
        let credential = Credential::new("super-secret", 60, "Bearer");
        let debug = format!("{credential:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("***"));
        assert_eq!(
            credential.expires_at() - credential.obtained_at,
            chrono::Duration::seconds(60)
        );
    }

    mod properties {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn encoded_values_never_break_form_structure(value in ".*") {
                let encoded = encode_form_value(&value);
                prop_assert!(!encoded.contains('&'));
                prop_assert!(!encoded.contains('='));
                prop_assert!(!encoded.contains(' '));
                prop_assert!(encoded.is_ascii());
            }

            #[test]
            fn device_code_body_has_exactly_two_fields(client in ".*", audience in ".*") {
                let body = build_device_code_body(&client, &audience);
                prop_assert_eq!(body.split('&').count(), 2);
                prop_assert!(body.starts_with("client_id="));
            }
        }
    }
}

//! Minimal HTTP transport shim for the identity provider
//!
//! The authenticator talks to the provider only through [`HttpClient`], so
//! tests can intercept and inspect every outbound request without a network.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::Method;
use std::time::Duration;
use thiserror::Error;

/// Outbound HTTP request as seen by the shim
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpRequest {
    /// Build a POST request carrying a form-encoded body
    pub fn post_form(url: impl Into<String>, body: String) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: vec![(
                "content-type".to_string(),
                super::device::FORM_CONTENT_TYPE.to_string(),
            )],
            body,
        }
    }

    /// All values for a header name (case-insensitive)
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// Path component of the request URL
    pub fn path(&self) -> String {
        url::Url::parse(&self.url)
            .map(|u| u.path().to_string())
            .unwrap_or_default()
    }
}

/// Response status and body returned by the shim
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-level HTTP failures
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("HTTP client setup failed: {0}")]
    Setup(String),
    #[error("HTTP request failed")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Failed to read HTTP response body")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Injectable HTTP capability
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// Production [`HttpClient`] backed by reqwest
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::Setup(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(|e| HttpError::Request(Box::new(e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| HttpError::Body(Box::new(e)))?;

        Ok(HttpResponse { status, body })
    }
}

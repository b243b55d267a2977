//! Authenticated HTTP client for the Graph API.
//!
//! Wraps `reqwest::Client` with bearer authentication, base-URL
//! construction per national-cloud deployment, and internal retry for the
//! transient statuses 408/429/503/504 with exponential backoff honouring
//! `Retry-After`. Every other status is surfaced to the caller as a
//! [`RemoteError`] carrying the code.
//!
//! The client is cheap to clone (the inner `reqwest::Client` is
//! reference-counted); transfer workers clone one handle each so no HTTP
//! state is shared across a transfer.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use odmirror_core::config::Config;
use odmirror_core::domain::errors::RemoteError;

/// Maximum attempts for a transiently failing request.
const MAX_TRANSIENT_RETRIES: u32 = 5;

/// Base backoff when the server does not send `Retry-After`.
const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Ceiling for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Parses a `Retry-After` header value. Only the delta-seconds form is
/// honoured; HTTP-date values fall back to `default`.
pub(crate) fn parse_retry_after(value: &str, default: Duration) -> Duration {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[derive(Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl GraphClient {
    /// Creates a client for the given access token against the public
    /// cloud.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: "https://graph.microsoft.com/v1.0".to_string(),
            access_token: access_token.into(),
        }
    }

    /// Creates a client configured from the application config: national
    /// cloud base URL and the optional HTTP/1.1 pin.
    pub fn from_config(access_token: impl Into<String>, config: &Config) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if config.remote.force_http_11 {
            builder = builder.http1_only();
        }
        Ok(Self {
            http: builder.build()?,
            base_url: config.remote.azure_ad_endpoint.graph_base_url().to_string(),
            access_token: access_token.into(),
        })
    }

    /// Custom base URL, for tests against a mock server.
    pub fn with_base_url(access_token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            access_token: access_token.into(),
        }
    }

    /// Replaces the access token after a refresh.
    pub fn set_access_token(&mut self, token: impl Into<String>) {
        self.access_token = token.into();
        debug!("access token replaced");
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Builds an authenticated request for a path relative to the base URL.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.http.request(method, &url).bearer_auth(&self.access_token)
    }

    /// Builds an authenticated request against an absolute URL (nextLink,
    /// deltaLink and upload-session URLs are absolute).
    pub fn request_absolute(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(&self.access_token)
    }

    /// Sends a request, retrying 408/429/503/504 with exponential backoff.
    ///
    /// `build` is called once per attempt because a `RequestBuilder`
    /// cannot be reused after send. The returned response may still carry
    /// a non-transient error status; use [`Self::check_status`] or
    /// [`Self::expect_json`] to map it.
    pub async fn send_with_retry<F>(
        &self,
        operation: &str,
        build: F,
    ) -> Result<Response, RemoteError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            let response = build().send().await.map_err(|e| RemoteError::Transport {
                operation: operation.to_string(),
                message: e.to_string(),
            })?;

            let status = response.status();
            let transient = matches!(status.as_u16(), 408 | 429 | 503 | 504);
            if !transient {
                if attempt > 0 {
                    info!(operation, attempt, "request succeeded after retry");
                }
                return Ok(response);
            }

            if attempt >= MAX_TRANSIENT_RETRIES {
                warn!(operation, attempts = attempt + 1, "transient retry budget exhausted");
                return Err(error_from_response(operation, response).await);
            }

            let backoff = BASE_BACKOFF * 2u32.saturating_pow(attempt);
            let delay = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .map(|v| parse_retry_after(v, backoff))
                .unwrap_or(backoff)
                .min(MAX_BACKOFF);

            warn!(
                operation,
                status = status.as_u16(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "transient status, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Maps a non-success status to [`RemoteError`], passing successes
    /// through.
    pub async fn check_status(
        &self,
        operation: &str,
        response: Response,
    ) -> Result<Response, RemoteError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(operation, response).await)
        }
    }

    /// Sends with retry, checks the status, and decodes the JSON body.
    pub async fn expect_json<T, F>(&self, operation: &str, build: F) -> Result<T, RemoteError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let response = self.send_with_retry(operation, build).await?;
        let response = self.check_status(operation, response).await?;
        response.json::<T>().await.map_err(|e| RemoteError::Decode {
            operation: operation.to_string(),
            message: e.to_string(),
        })
    }

    /// Sends with retry and checks the status, discarding the body.
    pub async fn expect_ok<F>(&self, operation: &str, build: F) -> Result<(), RemoteError>
    where
        F: Fn() -> RequestBuilder,
    {
        let response = self.send_with_retry(operation, build).await?;
        self.check_status(operation, response).await.map(|_| ())
    }
}

/// Builds a [`RemoteError::Status`] from a response, extracting the Graph
/// error message where the body carries one.
pub(crate) async fn error_from_response(operation: &str, response: Response) -> RemoteError {
    let status = response.status();
    let message = match response.json::<serde_json::Value>().await {
        Ok(body) => body
            .pointer("/error/message")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| body.to_string()),
        Err(_) => status
            .canonical_reason()
            .unwrap_or("unrecognised status")
            .to_string(),
    };
    RemoteError::status_error(status.as_u16(), operation, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(
            parse_retry_after("17", Duration::from_secs(1)),
            Duration::from_secs(17)
        );
        assert_eq!(
            parse_retry_after(" 5 ", Duration::from_secs(1)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_parse_retry_after_http_date_falls_back() {
        let fallback = Duration::from_secs(30);
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2026 07:28:00 GMT", fallback),
            fallback
        );
    }

    #[test]
    fn test_request_urls() {
        let client = GraphClient::with_base_url("tok", "http://localhost:9999");
        let req = client.request(Method::GET, "/me/drive").build().unwrap();
        assert_eq!(req.url().as_str(), "http://localhost:9999/me/drive");
        let auth = req.headers().get("authorization").unwrap().to_str().unwrap();
        assert_eq!(auth, "Bearer tok");
    }

}

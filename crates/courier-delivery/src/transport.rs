//! Pluggable network primitive for outbound calls.
//!
//! Everything above this module talks to destinations through [`Transport`].
//! Production wiring uses [`HttpTransport`]; the chaos engine and tests wrap
//! or replace it without touching global state.

use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Largest response body kept in memory.
const MAX_RESPONSE_BODY_BYTES: usize = 64 * 1024;

/// One HTTP POST to a destination.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Destination name, for logs and fault targeting.
    pub destination: String,
    /// Target URL.
    pub url: String,
    /// Extra request headers.
    pub headers: HashMap<String, String>,
    /// Serialized JSON body.
    pub body: Bytes,
    /// Hard deadline for this attempt.
    pub timeout: Duration,
    /// 1-based attempt number within the call.
    pub attempt: u32,
}

/// What the destination answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers with lowercase names.
    pub headers: HashMap<String, String>,
    /// Response body, truncated to 64 KiB.
    pub body: Bytes,
}

impl TransportResponse {
    /// Response with `status` and an empty body.
    pub fn empty(status: u16) -> Self {
        Self { status, headers: HashMap::new(), body: Bytes::new() }
    }

    /// Response with `status` and a JSON body.
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            headers: HashMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: Bytes::from(body.to_string()),
        }
    }

    /// Whether the status is 2xx.
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Numeric `Retry-After`, if present.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.headers.get("retry-after").and_then(|v| v.trim().parse().ok())
    }

    /// Body as lossy UTF-8.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends one request and reports the destination's answer.
///
/// Implementations return `Ok` for any HTTP status; only failures to obtain
/// a response (connect errors, resets, deadline expiry) are errors.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Performs the POST described by `request`.
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse>;
}

/// Settings for the reqwest-backed transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// `User-Agent` sent with every request.
    pub user_agent: String,
    /// Redirects followed before giving up.
    pub max_redirects: usize,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// Deadline for establishing a connection.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
            verify_tls: true,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Production transport over a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds the underlying HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the client cannot be built.
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Transport with default settings.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(&TransportConfig::default())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse> {
        let span = info_span!(
            "outbound_post",
            destination = %request.destination,
            url = %request.url,
            attempt = request.attempt
        );

        async move {
            let started = std::time::Instant::now();
            let mut http_request = self
                .client
                .post(&request.url)
                .timeout(request.timeout)
                .header("content-type", "application/json")
                .body(request.body);

            for (name, value) in &request.headers {
                if !is_managed_header(name) {
                    http_request = http_request.header(name, value);
                }
            }

            let response = http_request.send().await.map_err(|e| {
                tracing::warn!(elapsed_ms = elapsed_ms(started), error = %e, "request failed");
                if e.is_timeout() {
                    DeliveryError::timeout(u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX))
                } else if e.is_connect() {
                    DeliveryError::network(format!("connection failed: {e}"))
                } else {
                    DeliveryError::network(e.to_string())
                }
            })?;

            let status = response.status().as_u16();
            let headers = extract_headers(response.headers());
            let body = match response.bytes().await {
                Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_BYTES => {
                    bytes.slice(..MAX_RESPONSE_BODY_BYTES)
                },
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read response body");
                    Bytes::new()
                },
            };

            tracing::debug!(status, elapsed_ms = elapsed_ms(started), "response received");
            Ok(TransportResponse { status, headers, body })
        }
        .instrument(span)
        .await
    }
}

fn elapsed_ms(started: std::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

/// Hop-by-hop and client-controlled headers callers may not override.
fn is_managed_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

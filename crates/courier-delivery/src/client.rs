//! The single entry point for outbound calls: [`OutboundClient::post_json`].
//!
//! Each call takes a rate-limit token, then runs a bounded retry loop in
//! which every attempt first asks the destination's breaker for permission,
//! sends one POST under a hard deadline and reports the outcome back to the
//! breaker. Only one network attempt is in flight per call.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use courier_core::{Clock, Metric, MetricsRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    circuit::CircuitBreakerRegistry,
    error::{default_transient_predicate, DeliveryError, Result, TransientPredicate},
    ratelimit::RateLimiter,
    retry::{with_retry, BackoffPolicy},
    transport::{OutboundRequest, Transport, TransportResponse},
};

/// Longest error body kept in a rendered error.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Header carrying the attempt number within one call.
pub const ATTEMPT_HEADER: &str = "x-courier-attempt";

/// Tunables for [`OutboundClient`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Deadline per attempt when the caller gives none.
    pub default_timeout: Duration,
    /// Longest wait for a rate-limit token.
    pub rate_limit_wait_cap: Duration,
    /// Backoff between attempts of one call.
    pub backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            rate_limit_wait_cap: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Arguments to [`OutboundClient::post_json`].
#[derive(Debug, Clone, PartialEq)]
pub struct PostJson {
    /// Destination name; selects breaker and bucket.
    pub destination: String,
    /// Target URL.
    pub url: String,
    /// JSON body.
    pub body: Value,
    /// Extra headers.
    pub headers: HashMap<String, String>,
    /// Per-attempt deadline; the client default when `None`.
    pub timeout: Option<Duration>,
    /// Whether to take a rate-limit token first.
    pub use_rate_limit: bool,
}

impl PostJson {
    /// Rate-limited POST with default timeout and no extra headers.
    pub fn new(destination: impl Into<String>, url: impl Into<String>, body: Value) -> Self {
        Self {
            destination: destination.into(),
            url: url.into(),
            body,
            headers: HashMap::new(),
            timeout: None,
            use_rate_limit: true,
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Adds several headers.
    #[must_use]
    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Sets the per-attempt deadline.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Skips rate limiting for this call.
    #[must_use]
    pub const fn without_rate_limit(mut self) -> Self {
        self.use_rate_limit = false;
        self
    }
}

/// Breaker-, rate-limit- and retry-aware JSON poster.
#[derive(Clone)]
pub struct OutboundClient {
    transport: Arc<dyn Transport>,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
    config: ClientConfig,
    is_transient: TransientPredicate,
}

impl std::fmt::Debug for OutboundClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundClient")
            .field("transport", &self.transport)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OutboundClient {
    /// Creates a client over shared breaker and limiter registries.
    pub fn new(
        transport: Arc<dyn Transport>,
        breakers: Arc<CircuitBreakerRegistry>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsRegistry>,
        clock: Arc<dyn Clock>,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            breakers,
            limiter,
            metrics,
            clock,
            config,
            is_transient: default_transient_predicate(),
        }
    }

    /// Replaces the transient-error classifier.
    #[must_use]
    pub fn with_transient_predicate(mut self, predicate: TransientPredicate) -> Self {
        self.is_transient = predicate;
        self
    }

    /// Breakers consulted by this client.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Rate limiter consulted by this client.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Posts `request.body` and returns the parsed response body.
    ///
    /// A 2xx response whose body is not JSON yields `{}`.
    ///
    /// # Errors
    ///
    /// - `RateLimitTimeout` if no token arrived in time; nothing is sent
    /// - `CircuitOpen` if the breaker refuses; nothing is sent
    /// - `ClientError`, `ServerError` or `RateLimited` for non-2xx answers
    /// - `Network` or `Timeout` when no answer arrived
    ///
    /// Transient errors are retried with backoff before being returned.
    pub async fn post_json(&self, request: PostJson) -> Result<Value> {
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);

        if request.use_rate_limit {
            let wait = timeout.min(self.config.rate_limit_wait_cap);
            self.limiter.acquire(&request.destination, 1, wait).await?;
        }

        let body = serde_json::to_vec(&request.body)
            .map(Bytes::from)
            .map_err(|e| DeliveryError::configuration(format!("unserializable body: {e}")))?;

        let is_transient = self.is_transient.clone();
        let result = with_retry(&self.config.backoff, self.clock.as_ref(), &*is_transient, |attempt| {
            let mut headers = request.headers.clone();
            headers.insert(ATTEMPT_HEADER.to_string(), attempt.to_string());
            self.attempt(OutboundRequest {
                destination: request.destination.clone(),
                url: request.url.clone(),
                headers,
                body: body.clone(),
                timeout,
                attempt,
            })
        })
        .await;

        if let Err(error) = &result {
            tracing::warn!(
                destination = %request.destination,
                code = error.code(),
                category = %error.category(),
                error = %error,
                "outbound call failed"
            );
        }
        result
    }

    async fn attempt(&self, request: OutboundRequest) -> Result<Value> {
        let destination = request.destination.clone();
        self.breakers.check(&destination).await?;

        if request.attempt > 1 {
            self.metrics.inc(Metric::CallRetry);
        }
        self.metrics.inc(Metric::OutboundAttempt);

        let deadline = request.timeout;
        let outcome = match tokio::time::timeout(deadline, self.transport.send(request)).await {
            Ok(sent) => sent.and_then(into_json),
            Err(_) => Err(DeliveryError::timeout(
                u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            )),
        };

        match &outcome {
            Ok(_) => self.breakers.record_success(&destination).await,
            Err(error) => {
                tracing::debug!(destination = %destination, error = %error, "attempt failed");
                self.breakers.record_failure(&destination).await;
            },
        }
        outcome
    }
}

fn into_json(response: TransportResponse) -> Result<Value> {
    if !response.is_success() {
        let mut body = response.body_text();
        if let Some((cut, _)) = body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
            body.truncate(cut);
        }
        return Err(DeliveryError::from_status(
            response.status,
            body,
            response.retry_after_seconds(),
        ));
    }

    Ok(serde_json::from_slice(&response.body).unwrap_or_else(|_| Value::Object(Default::default())))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn non_json_success_becomes_empty_object() {
        let response = TransportResponse {
            status: 200,
            headers: HashMap::new(),
            body: Bytes::from_static(b"ok"),
        };
        assert_eq!(into_json(response).unwrap(), json!({}));
        assert_eq!(into_json(TransportResponse::empty(204)).unwrap(), json!({}));
    }

    #[test]
    fn json_success_is_parsed() {
        let response = TransportResponse::json(201, &json!({"id": 7}));
        assert_eq!(into_json(response).unwrap(), json!({"id": 7}));
    }

    #[test]
    fn error_status_keeps_truncated_body() {
        let response = TransportResponse {
            status: 400,
            headers: HashMap::new(),
            body: Bytes::from("e".repeat(2_000)),
        };
        match into_json(response).unwrap_err() {
            DeliveryError::ClientError { status_code, body } => {
                assert_eq!(status_code, 400);
                assert_eq!(body.len(), MAX_ERROR_BODY_CHARS);
            },
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn builder_sets_fields() {
        let req = PostJson::new("slack", "https://hooks.example/x", json!({"text": "hi"}))
            .header("x-a", "1")
            .timeout(Duration::from_secs(2))
            .without_rate_limit();
        assert_eq!(req.headers.get("x-a").map(String::as_str), Some("1"));
        assert_eq!(req.timeout, Some(Duration::from_secs(2)));
        assert!(!req.use_rate_limit);
    }
}

//! Error taxonomy for outbound delivery.
//!
//! Errors fall into four groups that drive every retry decision:
//! transient failures (retried with backoff), admission denials (breaker open
//! or rate-limit wait expired, never reach the network), permanent rejections
//! (4xx, propagated at once) and infrastructure failures (storage,
//! configuration).

use std::{fmt, sync::Arc};

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors produced while delivering a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Connection could not be established or was reset.
    #[error("network error: {message}")]
    Network {
        /// Transport-level description
        message: String,
    },

    /// The attempt exceeded its hard deadline.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline that was exceeded, in milliseconds
        timeout_ms: u64,
    },

    /// Destination rejected the payload with a 4xx status.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// Destination failed with a 5xx status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// Destination answered 429.
    #[error("rate limited by destination (HTTP 429)")]
    RateLimited {
        /// Value of a numeric `Retry-After` header, if present
        retry_after_seconds: Option<u64>,
    },

    /// The destination's breaker refused the call.
    #[error("circuit open for destination {destination}")]
    CircuitOpen {
        /// Destination whose breaker is open
        destination: String,
    },

    /// No rate-limit token became available before the wait deadline.
    #[error("rate limit wait for {destination} timed out after {waited_ms}ms")]
    RateLimitTimeout {
        /// Destination whose bucket was empty
        destination: String,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// Storage access failed.
    #[error("database error: {message}")]
    Database {
        /// Underlying storage error
        message: String,
    },

    /// Invalid configuration or request.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem
        message: String,
    },

    /// Anything else.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Maps a non-2xx status to the matching variant.
    pub fn from_status(status_code: u16, body: impl Into<String>, retry_after: Option<u64>) -> Self {
        match status_code {
            429 => Self::RateLimited { retry_after_seconds: retry_after },
            500..=599 => Self::ServerError { status_code, body: body.into() },
            _ => Self::ClientError { status_code, body: body.into() },
        }
    }

    /// Creates a circuit-open rejection.
    pub fn circuit_open(destination: impl Into<String>) -> Self {
        Self::CircuitOpen { destination: destination.into() }
    }

    /// Creates a rate-limit wait timeout.
    pub fn rate_limit_timeout(destination: impl Into<String>, waited_ms: u64) -> Self {
        Self::RateLimitTimeout { destination: destination.into(), waited_ms }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Stable code surfaced to callers and logs.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Network { .. } => "NETWORK",
            Self::Timeout { .. } => "TIMEOUT",
            Self::ClientError { .. } | Self::ServerError { .. } | Self::RateLimited { .. } => {
                "HTTP_STATUS"
            },
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::RateLimitTimeout { .. } => "RATE_LIMIT_TIMEOUT",
            Self::Database { .. } => "DATABASE",
            Self::Configuration { .. } => "CONFIGURATION",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    /// HTTP status carried by the error, if the destination answered.
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Whether the call was refused before any network attempt.
    pub const fn is_admission_denied(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::RateLimitTimeout { .. })
    }

    /// Seconds the destination asked us to wait, when it said so.
    pub const fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => *retry_after_seconds,
            _ => None,
        }
    }

    /// Coarse grouping for logs and metrics.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::database(err.to_string())
    }
}

/// Decides whether a failed attempt is worth retrying.
pub type TransientPredicate = Arc<dyn Fn(&DeliveryError) -> bool + Send + Sync>;

const TRANSIENT_PHRASES: &[&str] = &[
    "timeout",
    "timed out",
    "econnreset",
    "connection reset",
    "connection refused",
    "socket hang up",
    "broken pipe",
    "502",
    "503",
    "504",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "rate limit",
    "too many requests",
];

/// Default classification: typed variants first, message phrases second.
pub fn is_transient(error: &DeliveryError) -> bool {
    match error {
        DeliveryError::Network { .. }
        | DeliveryError::Timeout { .. }
        | DeliveryError::ServerError { .. }
        | DeliveryError::RateLimited { .. } => true,
        DeliveryError::ClientError { status_code, .. } => *status_code == 408,
        DeliveryError::CircuitOpen { .. }
        | DeliveryError::RateLimitTimeout { .. }
        | DeliveryError::Database { .. }
        | DeliveryError::Configuration { .. } => false,
        DeliveryError::Internal { message } => {
            let message = message.to_lowercase();
            TRANSIENT_PHRASES.iter().any(|phrase| message.contains(phrase))
        },
    }
}

/// [`is_transient`] wrapped as a shareable predicate.
pub fn default_transient_predicate() -> TransientPredicate {
    Arc::new(is_transient)
}

/// Error grouping for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network, timeout or 5xx.
    Transient,
    /// Breaker open or rate-limit wait expired.
    AdmissionDenied,
    /// 4xx from the destination.
    Rejected,
    /// Storage failure.
    Storage,
    /// Configuration or internal failure.
    System,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Network { .. }
            | DeliveryError::Timeout { .. }
            | DeliveryError::ServerError { .. }
            | DeliveryError::RateLimited { .. } => Self::Transient,
            DeliveryError::CircuitOpen { .. } | DeliveryError::RateLimitTimeout { .. } => {
                Self::AdmissionDenied
            },
            DeliveryError::ClientError { .. } => Self::Rejected,
            DeliveryError::Database { .. } => Self::Storage,
            DeliveryError::Configuration { .. } | DeliveryError::Internal { .. } => Self::System,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::AdmissionDenied => write!(f, "admission_denied"),
            Self::Rejected => write!(f, "rejected"),
            Self::Storage => write!(f, "storage"),
            Self::System => write!(f, "system"),
        }
    }
}

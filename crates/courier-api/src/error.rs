//! Error responses for the HTTP surface.
//!
//! Every failure renders as `{"error": {"code", "message"}}` with a status
//! derived from the underlying error.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_core::CoreError;
use courier_delivery::DeliveryError;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Error response with code and message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// Failures surfaced by handlers.
#[derive(Debug)]
pub enum ApiError {
    /// Request was malformed.
    BadRequest(String),
    /// Signature or bearer token was missing or wrong.
    Unauthorized(String),
    /// Entity does not exist.
    NotFound(String),
    /// Request conflicts with current service state.
    Conflict {
        /// Machine-readable code
        code: &'static str,
        /// Description
        message: String,
    },
    /// Body exceeds the ingestion limit.
    PayloadTooLarge(usize),
    /// Storage or validation failure.
    Core(CoreError),
    /// Delivery subsystem failure.
    Delivery(DeliveryError),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            Self::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "INVALID_INPUT", message.clone())
            },
            Self::Unauthorized(message) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message.clone())
            },
            Self::NotFound(message) => (StatusCode::NOT_FOUND, "NOT_FOUND", message.clone()),
            Self::Conflict { code, message } => (StatusCode::CONFLICT, code, message.clone()),
            Self::PayloadTooLarge(size) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                format!("payload of {size} bytes exceeds the ingestion limit"),
            ),
            Self::Core(err) => {
                let status = match err {
                    CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                    CoreError::ConstraintViolation(_) => StatusCode::CONFLICT,
                    CoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.code(), err.to_string())
            },
            Self::Delivery(err) => {
                let status = match err {
                    DeliveryError::Configuration { .. } => StatusCode::BAD_REQUEST,
                    DeliveryError::CircuitOpen { .. } | DeliveryError::RateLimitTimeout { .. } => {
                        StatusCode::SERVICE_UNAVAILABLE
                    },
                    DeliveryError::Network { .. }
                    | DeliveryError::Timeout { .. }
                    | DeliveryError::ClientError { .. }
                    | DeliveryError::ServerError { .. }
                    | DeliveryError::RateLimited { .. } => StatusCode::BAD_GATEWAY,
                    DeliveryError::Database { .. } | DeliveryError::Internal { .. } => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    },
                };
                (status, err.code(), err.to_string())
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            error!(code, error = %message, "request failed");
        }
        let body = ErrorResponse { error: ErrorDetail { code: code.to_string(), message } };
        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self::Core(err)
    }
}

impl From<DeliveryError> for ApiError {
    fn from(err: DeliveryError) -> Self {
        Self::Delivery(err)
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

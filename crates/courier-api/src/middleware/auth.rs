//! Bearer-token gate for operator endpoints.
//!
//! When no operator token is configured every request passes; otherwise
//! the `Authorization: Bearer <token>` header must match exactly.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::{crypto::tokens_match, error::ApiError, AppState};

/// Extracts the bearer token from the Authorization header.
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Axum middleware that rejects operator calls without the configured token.
///
/// # Errors
///
/// Returns `401` when the header is missing or carries the wrong token.
pub async fn operator_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = state.operator_token.as_deref() {
        let provided = extract_bearer(req.headers())
            .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".to_string()))?;
        if !tokens_match(provided, expected) {
            debug!(path = %req.uri().path(), "operator token rejected");
            return Err(ApiError::Unauthorized("invalid operator token".to_string()));
        }
    }

    Ok(next.run(req).await)
}

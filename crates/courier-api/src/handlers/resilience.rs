//! Breaker and rate-limit observability, plus live bucket reconfiguration.

use std::time::Duration;

use axum::{
    extract::{Path, State},
    Json,
};
use courier_delivery::{BucketConfig, BucketSnapshot, CircuitSnapshot};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{error::ApiResult, AppState};

/// Every breaker created so far.
#[instrument(name = "list_circuits", skip(state))]
pub async fn list_circuits(State(state): State<AppState>) -> Json<Vec<CircuitSnapshot>> {
    Json(state.engine.circuits().snapshots().await)
}

/// One destination's breaker; unknown destinations report a fresh CLOSED
/// breaker.
#[instrument(name = "get_circuit", skip(state))]
pub async fn get_circuit(
    State(state): State<AppState>,
    Path(destination): Path<String>,
) -> Json<CircuitSnapshot> {
    Json(state.engine.circuits().state(&destination).await)
}

/// Every bucket created so far.
#[instrument(name = "list_rate_limits", skip(state))]
pub async fn list_rate_limits(State(state): State<AppState>) -> Json<Vec<BucketSnapshot>> {
    Json(state.engine.rate_limiter().snapshots())
}

/// Body of `PUT /rate-limits/{destination}`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct BucketUpdate {
    /// Burst size.
    pub capacity: u32,
    /// Tokens credited per period.
    pub refill_rate: u32,
    /// Period length in milliseconds.
    #[serde(default = "default_refill_period_ms")]
    pub refill_period_ms: u64,
}

const fn default_refill_period_ms() -> u64 {
    1_000
}

/// Replaces a destination's bucket; the new bucket starts full.
///
/// # Errors
///
/// Returns 400 for a bucket that could never grant a token.
#[instrument(name = "configure_rate_limit", skip(state))]
pub async fn configure_rate_limit(
    State(state): State<AppState>,
    Path(destination): Path<String>,
    Json(update): Json<BucketUpdate>,
) -> ApiResult<Json<BucketSnapshot>> {
    let config = BucketConfig {
        capacity: update.capacity,
        refill_rate: update.refill_rate,
        refill_period: Duration::from_millis(update.refill_period_ms),
    };
    let limiter = state.engine.rate_limiter();
    limiter.configure(&destination, config)?;

    Ok(Json(BucketSnapshot {
        available: limiter.available(&destination),
        destination,
        config,
    }))
}

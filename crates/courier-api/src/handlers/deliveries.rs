//! Delivery job inspection and dead-letter replay.

use axum::{
    extract::{Path, State},
    Json,
};
use courier_core::{DeliveryJob, JobId, QueueStats};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    error::{ApiError, ApiResult},
    AppState,
};

/// Body of `POST /deliveries/replay`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplayRequest {
    /// Jobs to move from `failed` back to `retry`.
    pub ids: Vec<JobId>,
}

/// Response of `POST /deliveries/replay`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplayResponse {
    /// Jobs that were dead-lettered and are eligible again.
    pub replayed: u64,
}

/// Job counts by status.
///
/// # Errors
///
/// Returns 500 on storage failure.
#[instrument(name = "queue_stats", skip(state))]
pub async fn queue_stats(State(state): State<AppState>) -> ApiResult<Json<QueueStats>> {
    Ok(Json(state.engine.queue().queue_stats().await?))
}

/// One job by id.
///
/// # Errors
///
/// Returns 404 for an unknown id and 500 on storage failure.
#[instrument(name = "get_delivery", skip(state))]
pub async fn get_delivery(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<DeliveryJob>> {
    state
        .engine
        .queue()
        .find_job(JobId(id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("delivery {id} not found")))
}

/// Replays dead-lettered jobs; ids that are not `failed` are ignored.
///
/// # Errors
///
/// Returns 500 on storage failure.
#[instrument(name = "replay_deliveries", skip(state, request), fields(count = request.ids.len()))]
pub async fn replay(
    State(state): State<AppState>,
    Json(request): Json<ReplayRequest>,
) -> ApiResult<Json<ReplayResponse>> {
    let replayed = state.engine.queue().replay_failed(&request.ids).await?;
    info!(requested = request.ids.len(), replayed, "Replay requested");
    Ok(Json(ReplayResponse { replayed }))
}

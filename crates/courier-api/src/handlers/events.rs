//! Event ingestion and lookup.
//!
//! Ingestion validates the optional signature, persists the event
//! idempotently, and routes it to delivery jobs only the first time its id
//! is seen. The job table is the hand-off point; nothing here waits for a
//! delivery.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use courier_core::{DeliveryJob, Event, EventQuery, EventSummary, Metric, NewEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::{
    crypto::{verify_signature, SIGNATURE_HEADER},
    error::{ApiError, ApiResult},
    AppState,
};

/// Largest accepted ingestion body.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Request body for `POST /events`.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    /// Caller-supplied id; the idempotency key.
    pub id: String,
    /// Category tag.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Originating path.
    #[serde(default)]
    pub path: String,
    /// Arbitrary JSON, stored verbatim.
    #[serde(default)]
    pub body: Value,
}

/// Response from `POST /events`.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Event id.
    pub id: String,
    /// Whether the id had already been ingested.
    pub duplicate: bool,
    /// Delivery jobs created by this request.
    pub jobs_enqueued: usize,
}

/// Response from `GET /events/{id}`.
#[derive(Debug, Serialize)]
pub struct EventDetail {
    /// The stored event.
    #[serde(flatten)]
    pub event: Event,
    /// Delivery jobs spawned by the event.
    pub deliveries: Vec<DeliveryJob>,
}

/// Accepts an event for delivery.
///
/// # Errors
///
/// - 401: signature missing or invalid while a signing secret is set
/// - 413: body larger than [`MAX_PAYLOAD_BYTES`]
/// - 400: malformed JSON or invalid fields
/// - 500: storage failure (the event must not be silently dropped)
#[instrument(
    name = "ingest_event",
    skip(state, headers, body),
    fields(content_length = body.len())
)]
pub async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    if body.len() > MAX_PAYLOAD_BYTES {
        warn!(payload_size = body.len(), limit = MAX_PAYLOAD_BYTES, "Payload exceeds size limit");
        return Err(ApiError::PayloadTooLarge(body.len()));
    }

    if let Some(secret) = state.signing_secret.as_deref() {
        let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("");
        if let Err(e) = verify_signature(&body, signature, secret) {
            warn!(error = %e, "Rejected unsigned or mis-signed event");
            return Err(ApiError::Unauthorized(e.to_string()));
        }
    }

    let request: IngestRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid event body: {e}")))?;

    let event = NewEvent::new(request.id, request.event_type, request.path, request.body);
    event.validate()?;

    let metrics = state.engine.metrics();
    let ts = state.engine.clock().now_utc();
    let stored = event.clone().into_event(ts);

    if !state.events.insert_event(event, ts).await? {
        metrics.inc(Metric::EventsDuplicate);
        // Routing uses the stored event; the first body wins.
        let recovered = match state.events.find_event(stored.id.clone()).await? {
            Some(existing) => state.engine.route_missing(&existing).await?,
            None => Vec::new(),
        };
        debug!(event_id = %stored.id, recovered = recovered.len(), "Duplicate event");
        return Ok((
            StatusCode::ACCEPTED,
            Json(IngestResponse { id: stored.id, duplicate: true, jobs_enqueued: recovered.len() }),
        ));
    }
    metrics.inc(Metric::EventsIngested);

    let jobs = state.engine.route_event(&stored).await?;
    info!(
        event_id = %stored.id,
        event_type = %stored.event_type,
        jobs = jobs.len(),
        "Event ingested"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse { id: stored.id, duplicate: false, jobs_enqueued: jobs.len() }),
    ))
}

/// Lists events newest-first, filtered by `type`, `q` and `limit`.
///
/// # Errors
///
/// Returns 500 on storage failure.
#[instrument(name = "list_events", skip(state))]
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> ApiResult<Json<Vec<EventSummary>>> {
    Ok(Json(state.events.list_events(query).await?))
}

/// Returns one event with its deliveries.
///
/// # Errors
///
/// Returns 404 for an unknown id and 500 on storage failure.
#[instrument(name = "get_event", skip(state))]
pub async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EventDetail>> {
    let event = state
        .events
        .find_event(id.clone())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("event {id} not found")))?;
    let deliveries = state.engine.queue().jobs_for_event(&id).await?;

    Ok(Json(EventDetail { event, deliveries }))
}

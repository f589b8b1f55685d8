//! Health check handlers for service monitoring.
//!
//! `/health` touches the event store and the job table; `/live` only proves
//! the process answers.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::{Clock, EventStore, QueueStats};
use courier_delivery::DeliveryQueue;
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Job counts by status, when the job table answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueStats>,
    /// Whether the background worker is running
    pub worker_running: bool,
    /// Service version information
    pub version: String,
}

/// Overall health status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Critical systems failing
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Event store reachability
    pub storage: ComponentHealth,
    /// Job table reachability
    pub queue: ComponentHealth,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
}

/// Health service that encapsulates clock dependency for testable health
/// checks.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Checks the event store and the job table.
    pub async fn health_check(
        &self,
        events: &dyn EventStore,
        queue: &DeliveryQueue,
        worker_running: bool,
    ) -> HealthResponse {
        debug!("Performing health check");

        let timestamp = self.clock.now_utc();

        let started = self.clock.now();
        let storage = match events.health_check().await {
            Ok(()) => self.component(started, None),
            Err(e) => {
                error!(error = %e, "Event store health check failed");
                self.component(started, Some(format!("event store unavailable: {e}")))
            },
        };

        let started = self.clock.now();
        let (queue_health, stats) = match queue.queue_stats().await {
            Ok(stats) => (self.component(started, None), Some(stats)),
            Err(e) => {
                error!(error = %e, "Job table health check failed");
                (self.component(started, Some(format!("job table unavailable: {e}"))), None)
            },
        };

        let status = if storage.status == ComponentStatus::Up
            && queue_health.status == ComponentStatus::Up
        {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        HealthResponse {
            status,
            timestamp,
            checks: HealthChecks { storage, queue: queue_health },
            queue: stats,
            worker_running,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn component(&self, started: std::time::Instant, failure: Option<String>) -> ComponentHealth {
        let elapsed = self.clock.now().saturating_duration_since(started);
        ComponentHealth {
            status: if failure.is_none() { ComponentStatus::Up } else { ComponentStatus::Down },
            message: failure,
            response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Health check endpoint handler.
///
/// Cheap enough to be polled by load balancers.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let service = HealthService::new(state.engine.clock().clone());
    let response = service
        .health_check(state.events.as_ref(), state.engine.queue(), state.engine.is_running())
        .await;

    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(status = ?response.status, "Health check completed");

    (status_code, Json(response)).into_response()
}

/// Liveness check endpoint; never touches dependencies.
#[instrument(name = "liveness_check", skip(state))]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.engine.clock().now_utc(),
        "service": "courier"
    });

    (StatusCode::OK, Json(response)).into_response()
}

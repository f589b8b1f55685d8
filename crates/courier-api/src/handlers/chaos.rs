//! Chaos scenario control.
//!
//! Only available when the engine was built with the chaos layer; otherwise
//! starting or stopping a scenario answers 409.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use courier_delivery::{ActiveScenario, ChaosEngine, ChaosScenario};
use serde::Serialize;
use tracing::instrument;

use crate::{
    error::{ApiError, ApiResult},
    AppState,
};

/// Response of `GET /chaos`.
#[derive(Debug, Serialize)]
pub struct ChaosStatus {
    /// Whether the chaos layer is wired in.
    pub enabled: bool,
    /// Scenarios currently injecting faults.
    pub scenarios: Vec<ActiveScenario>,
}

fn chaos_engine(state: &AppState) -> ApiResult<&Arc<ChaosEngine>> {
    state.engine.chaos().ok_or_else(|| ApiError::Conflict {
        code: "CHAOS_DISABLED",
        message: "chaos layer is not enabled".to_string(),
    })
}

/// Lists active scenarios.
#[instrument(name = "list_chaos", skip(state))]
pub async fn list_scenarios(State(state): State<AppState>) -> Json<ChaosStatus> {
    let status = match state.engine.chaos() {
        Some(chaos) => ChaosStatus { enabled: true, scenarios: chaos.active() },
        None => ChaosStatus { enabled: false, scenarios: Vec::new() },
    };
    Json(status)
}

/// Starts or replaces scenario `name`.
///
/// # Errors
///
/// Returns 409 when chaos is disabled and 400 for an invalid fault.
#[instrument(name = "start_chaos", skip(state, scenario))]
pub async fn start_scenario(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(scenario): Json<ChaosScenario>,
) -> ApiResult<(StatusCode, Json<ActiveScenario>)> {
    let active = chaos_engine(&state)?.start(&name, scenario)?;
    Ok((StatusCode::CREATED, Json(active)))
}

/// Stops scenario `name`.
///
/// # Errors
///
/// Returns 409 when chaos is disabled and 404 for an unknown scenario.
#[instrument(name = "stop_chaos", skip(state))]
pub async fn stop_scenario(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    if chaos_engine(&state)?.stop(&name) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("chaos scenario {name} is not running")))
    }
}

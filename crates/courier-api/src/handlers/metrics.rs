//! Prometheus scrape endpoint.

use axum::{extract::State, http::header, response::IntoResponse};
use courier_core::metrics::TEXT_CONTENT_TYPE;

use crate::AppState;

/// Renders every counter in text exposition format.
pub async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], state.engine.metrics().render())
}

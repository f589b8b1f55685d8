//! HTTP request handlers for the courier API.
//!
//! Handlers are grouped by functionality:
//! - `events` - ingestion and event lookup
//! - `deliveries` - job inspection and dead-letter replay
//! - `resilience` - breaker and rate-limit views
//! - `chaos` - fault injection control
//! - `health` - liveness and dependency checks
//! - `metrics` - Prometheus scrape target
//!
//! Failures render through [`crate::error::ApiError`].

pub mod chaos;
pub mod deliveries;
pub mod events;
pub mod health;
pub mod metrics;
pub mod resilience;

pub use chaos::{list_scenarios, start_scenario, stop_scenario};
pub use deliveries::{get_delivery, queue_stats, replay};
pub use events::{get_event, ingest_event, list_events};
pub use health::{health_check, liveness_check};
pub use metrics::render_metrics;
pub use resilience::{configure_rate_limit, get_circuit, list_circuits, list_rate_limits};

//! Core domain types for the courier delivery pipeline.
//!
//! Holds the event and job models, the storage layer for both tables, the
//! clock abstraction every timing decision goes through, and the process-wide
//! metrics registry.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod metrics;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use metrics::{Metric, MetricsRegistry};
pub use models::{
    AttemptFailure, DeliveryJob, Event, EventQuery, EventSummary, JobId, JobStatus, NewEvent,
    NewJob, QueueStats,
};
pub use storage::{memory::MemoryEventStore, EventStore, Storage};
pub use time::{Clock, RealClock, TestClock};

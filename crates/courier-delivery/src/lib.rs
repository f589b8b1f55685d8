//! Outbound delivery for courier.
//!
//! Jobs written by the ingestion path are drained by a single worker that
//! posts each payload through a resilience stack:
//!
//! 1. **Rate limiter** - per-destination token bucket, refilled lazily
//! 2. **Circuit breaker** - per-destination CLOSED/OPEN/HALF_OPEN gate
//! 3. **Bounded retry** - up to five attempts per call with jittered backoff
//! 4. **Queue backoff** - failed jobs are rescheduled, then dead-lettered
//!    after eight attempts and kept until replayed
//!
//! The network sits behind the [`Transport`] trait so the chaos layer and
//! test doubles can stand in for `reqwest`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{MetricsRegistry, RealClock};
//! use courier_delivery::{
//!     storage::memory::MemoryQueueStorage, DeliveryConfig, DeliveryEngine, HttpTransport,
//! };
//!
//! # async fn example() -> courier_delivery::Result<()> {
//! let engine = DeliveryEngine::new(
//!     DeliveryConfig::default(),
//!     Arc::new(MemoryQueueStorage::new()),
//!     Arc::new(HttpTransport::with_defaults()?),
//!     Arc::new(RealClock::new()),
//!     Arc::new(MetricsRegistry::new()),
//! )?;
//! engine.start().await;
//! # Ok(())
//! # }
//! ```

pub mod chaos;
pub mod circuit;
pub mod client;
pub mod engine;
pub mod error;
pub mod queue;
pub mod ratelimit;
pub mod retry;
pub mod routing;
pub mod storage;
pub mod transport;
pub mod worker;

pub use chaos::{ActiveScenario, ChaosEngine, ChaosScenario, ChaosTransport, Fault};
pub use circuit::{CircuitBreakerRegistry, CircuitConfig, CircuitSnapshot, CircuitState};
pub use client::{ClientConfig, OutboundClient, PostJson};
pub use engine::{DeliveryConfig, DeliveryEngine, RateLimitConfig};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use queue::DeliveryQueue;
pub use ratelimit::{BucketConfig, BucketSnapshot, RateLimiter};
pub use retry::{with_retry, BackoffPolicy, RetryDecision, RetryPolicy};
pub use routing::{EventRouter, Route};
pub use storage::{PostgresQueueStorage, QueueStorage};
pub use transport::{HttpTransport, OutboundRequest, Transport, TransportConfig, TransportResponse};
pub use worker::{DeliveryWorker, WorkerConfig};

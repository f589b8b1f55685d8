//! Test infrastructure for deterministic delivery tests.
//!
//! [`TestEnv`] wires a real [`DeliveryEngine`] over in-memory stores, a
//! [`StubTransport`] and a manually advanced [`TestClock`], so breaker
//! cooldowns, bucket refills and job due-times can be stepped through
//! without sleeping or a database.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use courier_core::{
    DeliveryJob, EventStore, JobId, MemoryEventStore, MetricsRegistry, NewEvent, NewJob,
};
pub use courier_core::{Clock, TestClock};
use courier_delivery::{
    storage::memory::MemoryQueueStorage, BackoffPolicy, ClientConfig, DeliveryConfig,
    DeliveryEngine, RetryPolicy,
};

pub mod fixtures;
pub mod transport;

pub use fixtures::{job_for, EventBuilder};
pub use transport::{StubReply, StubTransport};

/// Delivery engine over in-memory collaborators.
pub struct TestEnv {
    /// Deterministic clock shared by every component
    pub clock: TestClock,
    /// Metrics registry the engine reports to
    pub metrics: Arc<MetricsRegistry>,
    /// Inbound event store
    pub events: MemoryEventStore,
    /// Job table
    pub jobs: MemoryQueueStorage,
    /// Scripted outbound transport
    pub transport: StubTransport,
    /// Engine under test
    pub engine: Arc<DeliveryEngine>,
}

impl TestEnv {
    /// Environment with [`TestEnv::deterministic_config`].
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects the configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(Self::deterministic_config())
    }

    /// Default configuration with every jitter disabled.
    pub fn deterministic_config() -> DeliveryConfig {
        DeliveryConfig {
            client: ClientConfig {
                backoff: BackoffPolicy { jitter: 0.0, ..BackoffPolicy::default() },
                ..ClientConfig::default()
            },
            retry: RetryPolicy { jitter: 0.0, ..RetryPolicy::default() },
            ..DeliveryConfig::default()
        }
    }

    /// Environment running `config`.
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects the configuration.
    pub fn with_config(config: DeliveryConfig) -> Result<Self> {
        let clock = TestClock::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let jobs = MemoryQueueStorage::new();
        let transport = StubTransport::new();

        let engine = DeliveryEngine::new(
            config,
            Arc::new(jobs.clone()),
            Arc::new(transport.clone()),
            Arc::new(clock.clone()),
            metrics.clone(),
        )
        .context("failed to build delivery engine")?;

        Ok(Self {
            clock,
            metrics,
            events: MemoryEventStore::new(),
            jobs,
            transport,
            engine: Arc::new(engine),
        })
    }

    /// Enqueues `job` through the engine's queue.
    ///
    /// # Errors
    ///
    /// Returns error if the queue rejects the job.
    pub async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        Ok(self.engine.queue().enqueue(job).await?)
    }

    /// Stores `event` and routes it; a duplicate only gets the jobs it is
    /// still missing.
    ///
    /// Returns whether the event was new and the jobs it produced.
    ///
    /// # Errors
    ///
    /// Returns error if validation, storage or enqueueing fails.
    pub async fn ingest(&self, event: NewEvent) -> Result<(bool, Vec<JobId>)> {
        event.validate()?;
        let ts = self.clock.now_utc();
        let stored = event.clone().into_event(ts);
        if !self.events.insert_event(event, ts).await? {
            let ids = match self.events.find_event(stored.id.clone()).await? {
                Some(existing) => self.engine.route_missing(&existing).await?,
                None => Vec::new(),
            };
            return Ok((false, ids));
        }
        let ids = self.engine.route_event(&stored).await?;
        Ok((true, ids))
    }

    /// Loads a job that must exist.
    ///
    /// # Errors
    ///
    /// Returns error if the job is missing.
    pub async fn job(&self, id: JobId) -> Result<DeliveryJob> {
        self.engine.queue().find_job(id).await?.with_context(|| format!("job {id} not found"))
    }

    /// Runs one worker batch.
    ///
    /// # Errors
    ///
    /// Returns error if the job store fails.
    pub async fn run_delivery_cycle(&self) -> Result<usize> {
        Ok(self.engine.process_batch().await?)
    }

    /// Moves the clock forward.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Alternates worker batches and clock jumps to the job's next due
    /// time until it is terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the job is still eligible after `max_cycles`.
    pub async fn run_until_terminal(&self, id: JobId, max_cycles: usize) -> Result<DeliveryJob> {
        for _ in 0..max_cycles {
            self.run_delivery_cycle().await?;
            let job = self.job(id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            let now = self.clock.now_utc();
            if job.next_attempt_at > now {
                let wait = (job.next_attempt_at - now).to_std().unwrap_or_default();
                self.advance_time(wait + Duration::from_millis(1));
            }
        }
        bail!("job {id} still eligible after {max_cycles} cycles")
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{JobStatus, Metric};

    use super::*;

    #[tokio::test]
    async fn successful_job_needs_one_cycle() {
        let env = TestEnv::new().unwrap();
        let id = env.enqueue(job_for("crm")).await.unwrap();

        assert_eq!(env.run_delivery_cycle().await.unwrap(), 1);
        assert_eq!(env.job(id).await.unwrap().status, JobStatus::Ok);
        assert_eq!(env.metrics.get(Metric::OutboundOk), 1);
    }

    #[tokio::test]
    async fn duplicate_ingest_enqueues_nothing() {
        let mut config = TestEnv::deterministic_config();
        config.routes = vec![courier_delivery::Route::new("crm", "https://crm.example/hook")];
        let env = TestEnv::with_config(config).unwrap();

        let event = EventBuilder::new().id("evt-dup").build();
        let (fresh, ids) = env.ingest(event.clone()).await.unwrap();
        assert!(fresh);
        assert_eq!(ids.len(), 1);

        let (fresh, ids) = env.ingest(event).await.unwrap();
        assert!(!fresh);
        assert!(ids.is_empty());
    }
}

//! Durable hand-off between ingestion and delivery.
//!
//! Enqueueing writes the job row and returns; nothing in memory needs to
//! survive a restart. The worker is the only mutator after that.

use std::sync::Arc;

use courier_core::{Clock, DeliveryJob, JobId, Metric, MetricsRegistry, NewJob, QueueStats};

use crate::{
    error::{DeliveryError, Result},
    storage::QueueStorage,
};

/// Front door to the job table.
#[derive(Clone)]
pub struct DeliveryQueue {
    storage: Arc<dyn QueueStorage>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue").finish_non_exhaustive()
    }
}

impl DeliveryQueue {
    /// Creates a queue over `storage`.
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self { storage, clock, metrics }
    }

    /// Underlying job storage.
    pub fn storage(&self) -> &Arc<dyn QueueStorage> {
        &self.storage
    }

    /// Inserts a `pending` job due immediately.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an empty destination or URL and
    /// `Database` when the insert fails.
    pub async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        if job.destination.trim().is_empty() || job.url.trim().is_empty() {
            return Err(DeliveryError::configuration("job needs a destination and a url"));
        }

        let destination = job.destination.clone();
        let event_id = job.event_id.clone();
        let id = self.storage.enqueue(job, self.clock.now_utc()).await?;

        self.metrics.inc(Metric::JobsEnqueued);
        tracing::debug!(job_id = %id, event_id = %event_id, destination = %destination, "job enqueued");
        Ok(id)
    }

    /// Enqueues every job, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first enqueue error; earlier jobs stay enqueued.
    pub async fn enqueue_all(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>> {
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(self.enqueue(job).await?);
        }
        Ok(ids)
    }

    /// Requeues dead-lettered jobs among `ids`; other ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns `Database` when the update fails.
    pub async fn replay_failed(&self, ids: &[JobId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let replayed = self.storage.replay_failed(ids.to_vec(), self.clock.now_utc()).await?;
        self.metrics.inc_by(Metric::JobsReplayed, replayed);
        tracing::info!(requested = ids.len(), replayed, "replayed dead-lettered jobs");
        Ok(replayed)
    }

    /// Job counts by status.
    ///
    /// # Errors
    ///
    /// Returns `Database` when the query fails.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(self.storage.queue_stats().await?)
    }

    /// Loads one job.
    ///
    /// # Errors
    ///
    /// Returns `Database` when the query fails.
    pub async fn find_job(&self, id: JobId) -> Result<Option<DeliveryJob>> {
        Ok(self.storage.find_job(id).await?)
    }

    /// Jobs derived from one event.
    ///
    /// # Errors
    ///
    /// Returns `Database` when the query fails.
    pub async fn jobs_for_event(&self, event_id: &str) -> Result<Vec<DeliveryJob>> {
        Ok(self.storage.jobs_for_event(event_id.to_string()).await?)
    }
}

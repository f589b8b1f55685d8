//! The single logical delivery worker.
//!
//! Polls due jobs in batches, drives each through [`OutboundClient`] and
//! persists the outcome. Individual delivery failures are recorded and the
//! loop carries on; a failing job store ends the loop.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    AttemptFailure, Clock, CoreError, DeliveryJob, JobStatus, Metric, MetricsRegistry,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{OutboundClient, PostJson},
    error::{DeliveryError, Result},
    retry::{RetryDecision, RetryPolicy},
    routing::EventRouter,
    storage::QueueStorage,
};

/// Header carrying the originating event id.
pub const EVENT_ID_HEADER: &str = "x-courier-event-id";

/// Polling parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Jobs fetched per poll.
    pub batch_size: usize,
    /// Sleep between polls that found nothing.
    pub poll_interval: Duration,
    /// Per-attempt deadline handed to the client.
    pub delivery_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            poll_interval: Duration::from_secs(1),
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

/// Drains due jobs until cancelled.
pub struct DeliveryWorker {
    storage: Arc<dyn QueueStorage>,
    client: Arc<OutboundClient>,
    router: Arc<EventRouter>,
    policy: RetryPolicy,
    config: WorkerConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    /// Creates a worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        client: Arc<OutboundClient>,
        router: Arc<EventRouter>,
        policy: RetryPolicy,
        config: WorkerConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRegistry>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { storage, client, router, policy, config, clock, metrics, cancellation_token }
    }

    /// Main loop: poll, process, sleep when idle.
    ///
    /// # Errors
    ///
    /// Returns `Database` once the job store becomes unreachable; the loop
    /// does not continue past that.
    pub async fn run(&self) -> Result<()> {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms =
                u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "delivery worker starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(err) => {
                    self.metrics.inc(Metric::WorkerErrors);
                    error!(error = %err, "delivery worker aborted: job store unavailable");
                    return Err(err);
                },
            }
        }

        info!("delivery worker stopped");
        Ok(())
    }

    /// Fetches one batch of due jobs and processes them in order.
    ///
    /// Returns the number of jobs fetched. Cancellation is honoured between
    /// jobs, never in the middle of one.
    ///
    /// # Errors
    ///
    /// Returns `Database` if fetching or persisting an outcome fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let jobs = self
            .storage
            .fetch_due(self.clock.now_utc(), self.config.batch_size)
            .await
            .map_err(|e| DeliveryError::database(format!("failed to fetch due jobs: {e}")))?;
        let fetched = jobs.len();
        if fetched > 0 {
            debug!(fetched, "processing job batch");
        }

        for job in jobs {
            if self.cancellation_token.is_cancelled() {
                debug!("cancellation requested, leaving rest of batch");
                break;
            }
            self.process_job(job).await?;
        }

        Ok(fetched)
    }

    async fn process_job(&self, job: DeliveryJob) -> Result<()> {
        let attempt = job.attempt_count().saturating_add(1);
        let mut request = PostJson::new(&job.destination, &job.url, job.payload.clone())
            .header(EVENT_ID_HEADER, &job.event_id)
            .timeout(self.config.delivery_timeout);
        if let Some(headers) = self.router.headers_for(&job.destination) {
            request = request.headers(headers.clone());
        }

        debug!(job_id = %job.id, destination = %job.destination, attempt, "attempting job");
        let outcome = self.client.post_json(request).await;
        let now = self.clock.now_utc();

        let persisted = match outcome {
            Ok(_) => {
                self.metrics.inc(Metric::OutboundOk);
                info!(job_id = %job.id, destination = %job.destination, attempt, "job delivered");
                self.storage.mark_ok(job.id, now).await
            },
            Err(err) => {
                let failure = self.failure_for(&job, attempt, &err, now);
                self.storage.record_failure(job.id, failure, now).await
            },
        };

        match persisted {
            Ok(()) => Ok(()),
            Err(CoreError::NotFound(message)) => {
                warn!(
                    job_id = %job.id,
                    detail = %message,
                    "job vanished before its outcome was saved"
                );
                Ok(())
            },
            Err(err) => Err(DeliveryError::database(format!(
                "failed to persist outcome of job {}: {err}",
                job.id
            ))),
        }
    }

    fn failure_for(
        &self,
        job: &DeliveryJob,
        attempts: u32,
        err: &DeliveryError,
        now: DateTime<Utc>,
    ) -> AttemptFailure {
        match self.policy.decide(attempts, now) {
            RetryDecision::Retry { next_attempt_at } => {
                self.metrics.inc(Metric::OutboundRetry);
                warn!(
                    job_id = %job.id,
                    destination = %job.destination,
                    attempts,
                    code = err.code(),
                    error = %err,
                    next_attempt_at = %next_attempt_at,
                    "job attempt failed, rescheduled"
                );
                AttemptFailure {
                    attempts,
                    status: JobStatus::Retry,
                    last_error: err.to_string(),
                    next_attempt_at,
                }
            },
            RetryDecision::GiveUp { reason } => {
                self.metrics.inc(Metric::OutboundFailed);
                self.metrics.inc(Metric::RetryExhausted);
                error!(
                    job_id = %job.id,
                    event_id = %job.event_id,
                    destination = %job.destination,
                    attempts,
                    reason = %reason,
                    error = %err,
                    "job dead-lettered"
                );
                AttemptFailure {
                    attempts,
                    status: JobStatus::Failed,
                    last_error: format!("retries exhausted after {attempts} attempts: {err}"),
                    next_attempt_at: now,
                }
            },
        }
    }
}

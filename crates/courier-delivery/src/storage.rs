//! Storage seam for the delivery queue.
//!
//! [`QueueStorage`] covers every job-table operation the queue and worker
//! need. [`PostgresQueueStorage`] forwards to the `outbound_attempts`
//! repository; [`memory::MemoryQueueStorage`] keeps jobs in process with the
//! same ordering and status rules so the worker can be driven without a
//! database.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    storage::Storage, AttemptFailure, DeliveryJob, JobId, NewJob, QueueStats, Result,
};

/// Job-table operations used by the delivery queue and worker.
pub trait QueueStorage: Send + Sync + 'static {
    /// Inserts a `pending` job due at `now`.
    fn enqueue(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<JobId>> + Send + '_>>;

    /// Up to `limit` eligible jobs due at `now`, earliest due first.
    fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryJob>>> + Send + '_>>;

    /// Marks a job delivered, counting the successful attempt.
    fn mark_ok(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Persists a failed attempt.
    fn record_failure(
        &self,
        id: JobId,
        failure: AttemptFailure,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Moves `failed` jobs among `ids` back to `retry`; returns how many moved.
    fn replay_failed(
        &self,
        ids: Vec<JobId>,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;

    /// Counts by status.
    fn queue_stats(&self) -> Pin<Box<dyn Future<Output = Result<QueueStats>> + Send + '_>>;

    /// Loads one job.
    fn find_job(
        &self,
        id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryJob>>> + Send + '_>>;

    /// Jobs derived from one event, oldest first.
    fn jobs_for_event(
        &self,
        event_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryJob>>> + Send + '_>>;
}

/// [`QueueStorage`] backed by Postgres.
pub struct PostgresQueueStorage {
    storage: Arc<Storage>,
}

impl PostgresQueueStorage {
    /// Wraps the shared storage handle.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl QueueStorage for PostgresQueueStorage {
    fn enqueue(
        &self,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<JobId>> + Send + '_>> {
        Box::pin(async move { self.storage.outbound_attempts.insert(&job, now).await })
    }

    fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryJob>>> + Send + '_>> {
        Box::pin(async move { self.storage.outbound_attempts.fetch_due(now, limit).await })
    }

    fn mark_ok(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.storage.outbound_attempts.mark_ok(id, now).await })
    }

    fn record_failure(
        &self,
        id: JobId,
        failure: AttemptFailure,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.storage.outbound_attempts.record_failure(id, &failure, now).await
        })
    }

    fn replay_failed(
        &self,
        ids: Vec<JobId>,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        Box::pin(async move { self.storage.outbound_attempts.replay_failed(&ids, now).await })
    }

    fn queue_stats(&self) -> Pin<Box<dyn Future<Output = Result<QueueStats>> + Send + '_>> {
        Box::pin(async move { self.storage.outbound_attempts.stats().await })
    }

    fn find_job(
        &self,
        id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryJob>>> + Send + '_>> {
        Box::pin(async move { self.storage.outbound_attempts.find(id).await })
    }

    fn jobs_for_event(
        &self,
        event_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryJob>>> + Send + '_>> {
        Box::pin(async move { self.storage.outbound_attempts.find_by_event(&event_id).await })
    }
}

pub mod memory {
    //! In-process job table.
    //!
    //! Mirrors the Postgres semantics: ids are assigned in insertion order,
    //! due jobs come back ordered by `(next_attempt_at, id)` and replay only
    //! touches `failed` rows.

    use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc};

    use chrono::{DateTime, Utc};
    use courier_core::{
        AttemptFailure, CoreError, DeliveryJob, JobId, JobStatus, NewJob, QueueStats, Result,
    };
    use tokio::sync::RwLock;

    use super::QueueStorage;

    #[derive(Debug, Default)]
    struct Inner {
        jobs: BTreeMap<i64, DeliveryJob>,
        next_id: i64,
        fetch_error: Option<String>,
        enqueue_error: Option<String>,
    }

    /// [`QueueStorage`] held in memory.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryQueueStorage {
        inner: Arc<RwLock<Inner>>,
    }

    impl MemoryQueueStorage {
        /// Creates an empty job table.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next `fetch_due` fail with a database error.
        pub async fn inject_fetch_error(&self, message: impl Into<String>) {
            self.inner.write().await.fetch_error = Some(message.into());
        }

        /// Makes the next `enqueue` fail with a database error.
        pub async fn inject_enqueue_error(&self, message: impl Into<String>) {
            self.inner.write().await.enqueue_error = Some(message.into());
        }

        /// Every job, ordered by id.
        pub async fn all_jobs(&self) -> Vec<DeliveryJob> {
            self.inner.read().await.jobs.values().cloned().collect()
        }
    }

    fn not_found(id: JobId) -> CoreError {
        CoreError::NotFound(format!("job {id}"))
    }

    impl QueueStorage for MemoryQueueStorage {
        fn enqueue(
            &self,
            job: NewJob,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<JobId>> + Send + '_>> {
            Box::pin(async move {
                let mut inner = self.inner.write().await;
                if let Some(message) = inner.enqueue_error.take() {
                    return Err(CoreError::Database(message));
                }
                inner.next_id += 1;
                let id = JobId(inner.next_id);
                inner.jobs.insert(id.0, DeliveryJob {
                    id,
                    event_id: job.event_id,
                    destination: job.destination,
                    url: job.url,
                    payload: job.payload,
                    status: JobStatus::Pending,
                    attempts: 0,
                    last_error: None,
                    next_attempt_at: now,
                    created_at: now,
                    updated_at: now,
                });
                Ok(id)
            })
        }

        fn fetch_due(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryJob>>> + Send + '_>> {
            Box::pin(async move {
                let error = self.inner.write().await.fetch_error.take();
                if let Some(message) = error {
                    return Err(CoreError::Database(message));
                }

                let inner = self.inner.read().await;
                let mut due: Vec<DeliveryJob> =
                    inner.jobs.values().filter(|job| job.is_due(now)).cloned().collect();
                due.sort_by(|a, b| {
                    a.next_attempt_at.cmp(&b.next_attempt_at).then(a.id.0.cmp(&b.id.0))
                });
                due.truncate(limit);
                Ok(due)
            })
        }

        fn mark_ok(
            &self,
            id: JobId,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut inner = self.inner.write().await;
                let job = inner.jobs.get_mut(&id.0).ok_or_else(|| not_found(id))?;
                job.status = JobStatus::Ok;
                job.attempts = job.attempts.saturating_add(1);
                job.last_error = None;
                job.updated_at = now;
                Ok(())
            })
        }

        fn record_failure(
            &self,
            id: JobId,
            failure: AttemptFailure,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut inner = self.inner.write().await;
                let job = inner.jobs.get_mut(&id.0).ok_or_else(|| not_found(id))?;
                job.status = failure.status;
                job.attempts = i32::try_from(failure.attempts).unwrap_or(i32::MAX);
                job.last_error = Some(failure.last_error);
                job.next_attempt_at = failure.next_attempt_at;
                job.updated_at = now;
                Ok(())
            })
        }

        fn replay_failed(
            &self,
            ids: Vec<JobId>,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            Box::pin(async move {
                let mut inner = self.inner.write().await;
                let mut replayed = 0;
                for id in ids {
                    if let Some(job) = inner.jobs.get_mut(&id.0) {
                        if job.status == JobStatus::Failed {
                            job.status = JobStatus::Retry;
                            job.attempts = 0;
                            job.next_attempt_at = now;
                            job.updated_at = now;
                            replayed += 1;
                        }
                    }
                }
                Ok(replayed)
            })
        }

        fn queue_stats(&self) -> Pin<Box<dyn Future<Output = Result<QueueStats>> + Send + '_>> {
            Box::pin(async move {
                let inner = self.inner.read().await;
                let mut stats = QueueStats::default();
                for job in inner.jobs.values() {
                    stats.add(job.status, 1);
                }
                Ok(stats)
            })
        }

        fn find_job(
            &self,
            id: JobId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryJob>>> + Send + '_>> {
            Box::pin(async move { Ok(self.inner.read().await.jobs.get(&id.0).cloned()) })
        }

        fn jobs_for_event(
            &self,
            event_id: String,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryJob>>> + Send + '_>> {
            Box::pin(async move {
                Ok(self
                    .inner
                    .read()
                    .await
                    .jobs
                    .values()
                    .filter(|job| job.event_id == event_id)
                    .cloned()
                    .collect())
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use chrono::Duration;
        use serde_json::json;

        use super::*;

        fn job(destination: &str) -> NewJob {
            NewJob::new("evt-1", destination, "https://example.test/hook", json!({}))
        }

        #[tokio::test]
        async fn due_jobs_come_back_earliest_first() {
            let store = MemoryQueueStorage::new();
            let now = Utc::now();
            let late = store.enqueue(job("a"), now).await.unwrap();
            let early = store.enqueue(job("b"), now - Duration::seconds(5)).await.unwrap();

            let due = store.fetch_due(now, 10).await.unwrap();
            let ids: Vec<JobId> = due.iter().map(|j| j.id).collect();
            assert_eq!(ids, vec![early, late]);
        }

        #[tokio::test]
        async fn future_and_terminal_jobs_are_not_due() {
            let store = MemoryQueueStorage::new();
            let now = Utc::now();
            let ok = store.enqueue(job("a"), now).await.unwrap();
            let later = store.enqueue(job("b"), now).await.unwrap();
            store.mark_ok(ok, now).await.unwrap();
            store
                .record_failure(
                    later,
                    AttemptFailure {
                        attempts: 1,
                        status: JobStatus::Retry,
                        last_error: "boom".into(),
                        next_attempt_at: now + Duration::minutes(1),
                    },
                    now,
                )
                .await
                .unwrap();

            assert!(store.fetch_due(now, 10).await.unwrap().is_empty());
            assert_eq!(store.fetch_due(now + Duration::minutes(1), 10).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn replay_ignores_jobs_that_are_not_failed() {
            let store = MemoryQueueStorage::new();
            let now = Utc::now();
            let pending = store.enqueue(job("a"), now).await.unwrap();
            let dead = store.enqueue(job("b"), now).await.unwrap();
            store
                .record_failure(
                    dead,
                    AttemptFailure {
                        attempts: 8,
                        status: JobStatus::Failed,
                        last_error: "gone".into(),
                        next_attempt_at: now,
                    },
                    now,
                )
                .await
                .unwrap();

            let replayed =
                store.replay_failed(vec![pending, dead, JobId(999)], now).await.unwrap();
            assert_eq!(replayed, 1);

            let job = store.find_job(dead).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Retry);
            assert_eq!(job.attempts, 0);
        }

        #[tokio::test]
        async fn injected_fetch_error_fires_once() {
            let store = MemoryQueueStorage::new();
            store.inject_fetch_error("db down").await;
            assert!(store.fetch_due(Utc::now(), 1).await.is_err());
            assert!(store.fetch_due(Utc::now(), 1).await.is_ok());
        }

        #[tokio::test]
        async fn mark_ok_on_unknown_job_is_not_found() {
            let store = MemoryQueueStorage::new();
            let err = store.mark_ok(JobId(42), Utc::now()).await.unwrap_err();
            assert!(matches!(err, CoreError::NotFound(_)));
        }
    }
}

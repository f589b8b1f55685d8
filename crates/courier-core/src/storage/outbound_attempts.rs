//! Repository for the `outbound_attempts` job table.
//!
//! The delivery worker is the only writer after insertion; replay is the one
//! operator-driven mutation and only ever touches `failed` rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{AttemptFailure, DeliveryJob, JobId, JobStatus, NewJob, QueueStats},
};

/// Postgres access to delivery jobs.
pub struct Repository {
    pool: Arc<PgPool>,
}

const JOB_COLUMNS: &str = "id, event_id, destination, url, payload, status, attempts, \
                           last_error, next_attempt_at, created_at, updated_at";

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a `pending` job due at `now`.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert(&self, job: &NewJob, now: DateTime<Utc>) -> Result<JobId> {
        let id = sqlx::query_scalar::<_, JobId>(
            r"
            INSERT INTO outbound_attempts (
                event_id, destination, url, payload, status, attempts,
                next_attempt_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, 0, $6, $6, $6)
            RETURNING id
            ",
        )
        .bind(&job.event_id)
        .bind(&job.destination)
        .bind(&job.url)
        .bind(sqlx::types::Json(&job.payload))
        .bind(JobStatus::Pending)
        .bind(now)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Eligible jobs due at or before `now`, earliest due first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeliveryJob>> {
        let sql = format!(
            r"
            SELECT {JOB_COLUMNS}
            FROM outbound_attempts
            WHERE status IN ('pending', 'retry')
              AND next_attempt_at <= $1
            ORDER BY next_attempt_at ASC, id ASC
            LIMIT $2
            "
        );
        let jobs = sqlx::query_as::<_, DeliveryJob>(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;

        Ok(jobs)
    }

    /// Marks a job delivered.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the job does not exist.
    pub async fn mark_ok(&self, id: JobId, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE outbound_attempts
            SET status = $2, attempts = attempts + 1, last_error = NULL, updated_at = $3
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(JobStatus::Ok)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(crate::CoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    /// Persists the outcome of a failed attempt.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the job does not exist.
    pub async fn record_failure(
        &self,
        id: JobId,
        failure: &AttemptFailure,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE outbound_attempts
            SET status = $2, attempts = $3, last_error = $4,
                next_attempt_at = $5, updated_at = $6
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(failure.status)
        .bind(i32::try_from(failure.attempts).unwrap_or(i32::MAX))
        .bind(&failure.last_error)
        .bind(failure.next_attempt_at)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(crate::CoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    /// Moves `failed` jobs among `ids` back to `retry`, due at `now`.
    ///
    /// The attempt counter restarts so the replayed job gets a fresh budget.
    /// Ids that are missing or not `failed` are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn replay_failed(&self, ids: &[JobId], now: DateTime<Utc>) -> Result<u64> {
        let raw: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let result = sqlx::query(
            r"
            UPDATE outbound_attempts
            SET status = 'retry', attempts = 0, next_attempt_at = $2, updated_at = $2
            WHERE id = ANY($1) AND status = 'failed'
            ",
        )
        .bind(&raw)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Job counts grouped by status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(JobStatus, i64)> = sqlx::query_as(
            r"
            SELECT status, COUNT(*)
            FROM outbound_attempts
            GROUP BY status
            ",
        )
        .fetch_all(&*self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.add(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }

    /// Loads one job.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, id: JobId) -> Result<Option<DeliveryJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM outbound_attempts WHERE id = $1");
        let job = sqlx::query_as::<_, DeliveryJob>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(job)
    }

    /// Every job derived from one event, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_event(&self, event_id: &str) -> Result<Vec<DeliveryJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM outbound_attempts WHERE event_id = $1 ORDER BY id ASC"
        );
        let jobs = sqlx::query_as::<_, DeliveryJob>(&sql)
            .bind(event_id)
            .fetch_all(&*self.pool)
            .await?;

        Ok(jobs)
    }
}

//! Durable storage for ingested events and outbound delivery jobs.
//!
//! All SQL lives in the repositories below. [`EventStore`] is the seam used
//! by the ingestion path so tests and local runs can substitute
//! [`memory::MemoryEventStore`] for Postgres.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub mod events;
pub mod memory;
pub mod outbound_attempts;

use crate::{
    error::Result,
    models::{Event, EventQuery, EventSummary, NewEvent},
};

/// Idempotent, append-only persistence of inbound events.
pub trait EventStore: Send + Sync + 'static {
    /// Persists `event` unless its id already exists.
    ///
    /// Returns `true` when a row was written and `false` for a duplicate id.
    /// Duplicates are never an error and never overwrite the stored body.
    fn insert_event(
        &self,
        event: NewEvent,
        ts: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Lists events newest-first with body previews.
    fn list_events(
        &self,
        query: EventQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventSummary>>> + Send + '_>>;

    /// Loads one event with its full body.
    fn find_event(
        &self,
        id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Event>>> + Send + '_>>;

    /// Verifies the backing store is reachable.
    fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Schema applied at startup. Every statement is idempotent.
const MIGRATIONS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS events (
        id   TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        ts   TIMESTAMPTZ NOT NULL DEFAULT now(),
        path TEXT NOT NULL DEFAULT '',
        body JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_events_ts ON events (ts DESC)",
    r"
    CREATE TABLE IF NOT EXISTS outbound_attempts (
        id              BIGSERIAL PRIMARY KEY,
        event_id        TEXT NOT NULL,
        destination     TEXT NOT NULL,
        url             TEXT NOT NULL,
        payload         JSONB NOT NULL,
        status          TEXT NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'retry', 'ok', 'failed')),
        attempts        INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        last_error      TEXT,
        next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_outbound_attempts_due
        ON outbound_attempts (status, next_attempt_at)
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_outbound_attempts_event
        ON outbound_attempts (event_id)
    ",
];

/// Container for the Postgres repositories sharing one pool.
#[derive(Clone)]
pub struct Storage {
    /// Inbound events.
    pub events: Arc<events::Repository>,

    /// Outbound delivery jobs.
    pub outbound_attempts: Arc<outbound_attempts::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates the repositories over `pool`.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);
        Self {
            events: Arc::new(events::Repository::new(pool.clone())),
            outbound_attempts: Arc::new(outbound_attempts::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates tables and indexes when missing.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&*self.pool).await?;
        }
        tracing::info!(statements = MIGRATIONS.len(), "database schema is up to date");
        Ok(())
    }

    /// Runs `SELECT 1` against the pool.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}

impl EventStore for Storage {
    fn insert_event(
        &self,
        event: NewEvent,
        ts: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let events = self.events.clone();
        Box::pin(async move { events.insert(&event.into_event(ts)).await })
    }

    fn list_events(
        &self,
        query: EventQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventSummary>>> + Send + '_>> {
        let events = self.events.clone();
        Box::pin(async move { events.list(&query).await })
    }

    fn find_event(
        &self,
        id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Event>>> + Send + '_>> {
        let events = self.events.clone();
        Box::pin(async move { events.find(&id).await })
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(Self::health_check(self))
    }
}

//! Repository for the `events` table.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Event, EventQuery, EventSummary, BODY_PREVIEW_CHARS},
};

/// Postgres access to ingested events.
pub struct Repository {
    pool: Arc<PgPool>,
}

/// Escapes `LIKE` wildcards so user input only ever matches literally.
pub(crate) fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts `event` unless the id exists; returns whether a row was written.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails for any reason other than a
    /// duplicate id.
    pub async fn insert(&self, event: &Event) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO events (id, type, ts, path, body)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(event.ts)
        .bind(&event.path)
        .bind(sqlx::types::Json(&event.body))
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Lists events newest-first, filtered by exact type and/or substring.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self, query: &EventQuery) -> Result<Vec<EventSummary>> {
        let pattern = query.needle().map(|needle| like_pattern(&needle));
        let preview_chars = i32::try_from(BODY_PREVIEW_CHARS).unwrap_or(i32::MAX);

        let rows = sqlx::query_as::<_, EventSummary>(
            r"
            SELECT id, type, ts, path,
                   LEFT(body::text, $4) AS body_preview,
                   char_length(body::text) > $4 AS truncated
            FROM events
            WHERE ($1::text IS NULL OR type = $1)
              AND ($2::text IS NULL
                   OR id ILIKE $2
                   OR type ILIKE $2
                   OR path ILIKE $2
                   OR body::text ILIKE $2)
            ORDER BY ts DESC, id DESC
            LIMIT $3
            ",
        )
        .bind(query.event_type.as_deref())
        .bind(pattern)
        .bind(i64::from(query.effective_limit()))
        .bind(preview_chars)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }

    /// Loads a single event with its full body.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, id: &str) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(
            r"
            SELECT id, type, ts, path, body
            FROM events
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }
}

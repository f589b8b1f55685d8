//! Domain models for ingested events and outbound delivery jobs.
//!
//! Includes the database encodings for identifiers and job status, and the
//! query/preview rules shared by every event store implementation.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Characters of serialized body kept in list previews.
pub const BODY_PREVIEW_CHARS: usize = 1200;

/// Upper bound on rows returned by a single event listing.
pub const MAX_LIST_LIMIT: u32 = 500;

/// Rows returned by an event listing when the caller gives no limit.
pub const DEFAULT_LIST_LIMIT: u32 = 100;

/// Longest accepted caller-supplied event id.
pub const MAX_EVENT_ID_LEN: usize = 255;

/// An inbound occurrence, immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    /// Caller-supplied id; the idempotency key.
    pub id: String,

    /// Category tag.
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub event_type: String,

    /// Ingestion time.
    pub ts: DateTime<Utc>,

    /// Path the event arrived on.
    pub path: String,

    /// Arbitrary JSON, persisted verbatim.
    #[sqlx(json)]
    pub body: Value,
}

impl Event {
    /// Truncated listing view of this event.
    pub fn summary(&self) -> EventSummary {
        let rendered = self.body.to_string();
        let (body_preview, truncated) = preview(&rendered);
        EventSummary {
            id: self.id.clone(),
            event_type: self.event_type.clone(),
            ts: self.ts,
            path: self.path.clone(),
            body_preview,
            truncated,
        }
    }

    /// Case-insensitive substring match across id, type, path and body.
    ///
    /// `needle` must already be lowercased.
    pub fn matches_query(&self, needle: &str) -> bool {
        self.id.to_lowercase().contains(needle)
            || self.event_type.to_lowercase().contains(needle)
            || self.path.to_lowercase().contains(needle)
            || self.body.to_string().to_lowercase().contains(needle)
    }
}

/// Cuts `rendered` to [`BODY_PREVIEW_CHARS`] characters.
pub fn preview(rendered: &str) -> (String, bool) {
    match rendered.char_indices().nth(BODY_PREVIEW_CHARS) {
        Some((cut, _)) => (rendered[..cut].to_string(), true),
        None => (rendered.to_string(), false),
    }
}

/// Event as submitted for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Caller-supplied unique id.
    pub id: String,

    /// Category tag.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Originating path.
    #[serde(default)]
    pub path: String,

    /// Arbitrary JSON body.
    #[serde(default)]
    pub body: Value,
}

impl NewEvent {
    /// Creates an event submission.
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        path: impl Into<String>,
        body: Value,
    ) -> Self {
        Self { id: id.into(), event_type: event_type.into(), path: path.into(), body }
    }

    /// Rejects submissions that cannot serve as idempotency keys.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for empty or oversized ids and empty
    /// types.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::InvalidInput("event id must not be empty".to_string()));
        }
        if self.id.len() > MAX_EVENT_ID_LEN {
            return Err(CoreError::InvalidInput(format!(
                "event id exceeds {MAX_EVENT_ID_LEN} bytes"
            )));
        }
        if self.event_type.trim().is_empty() {
            return Err(CoreError::InvalidInput("event type must not be empty".to_string()));
        }
        Ok(())
    }

    /// Materializes the stored event at `ts`.
    pub fn into_event(self, ts: DateTime<Utc>) -> Event {
        Event { id: self.id, event_type: self.event_type, ts, path: self.path, body: self.body }
    }
}

/// Listing row with the body cut to a preview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventSummary {
    /// Event id.
    pub id: String,

    /// Category tag.
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub event_type: String,

    /// Ingestion time.
    pub ts: DateTime<Utc>,

    /// Originating path.
    pub path: String,

    /// First [`BODY_PREVIEW_CHARS`] characters of the serialized body.
    pub body_preview: String,

    /// Whether the preview was cut.
    pub truncated: bool,
}

/// Filters for listing events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    /// Exact type match.
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,

    /// Case-insensitive substring over id, type, path and body.
    #[serde(default, rename = "q")]
    pub query: Option<String>,

    /// Maximum rows, clamped to [`MAX_LIST_LIMIT`].
    #[serde(default)]
    pub limit: Option<u32>,
}

impl EventQuery {
    /// Limit after defaulting and clamping.
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }

    /// Search needle, lowercased, or `None` when blank.
    pub fn needle(&self) -> Option<String> {
        self.query.as_deref().map(str::trim).filter(|q| !q.is_empty()).map(str::to_lowercase)
    }
}

/// Identifier of an outbound delivery job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for JobId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        Ok(Self(<i64 as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for JobId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Delivery job lifecycle.
///
/// ```text
/// pending -> ok
///         -> retry -> retry -> ... -> ok
///                                  -> failed (dead-letter)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Newly enqueued, due immediately.
    Pending,

    /// Failed at least once and rescheduled.
    Retry,

    /// Delivered. Terminal.
    Ok,

    /// Attempt budget exhausted. Terminal until replayed.
    Failed,
}

impl JobStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Pending, Self::Retry, Self::Ok, Self::Failed];

    /// Status as stored in the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retry => "retry",
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }

    /// Whether a job in this status is picked up once due.
    pub const fn is_eligible(self) -> bool {
        matches!(self, Self::Pending | Self::Retry)
    }

    /// Whether no further attempts will be made.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ok | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "retry" => Ok(Self::Retry),
            "ok" => Ok(Self::Ok),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::InvalidInput(format!("invalid job status: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse::<Self>()?)
    }
}

impl sqlx::Encode<'_, PgDb> for JobStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// A unit of outbound work bound to one event and one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryJob {
    /// Auto-increment id.
    pub id: JobId,

    /// Event this job was derived from.
    pub event_id: String,

    /// Destination name; selects breaker and bucket.
    pub destination: String,

    /// Target URL.
    pub url: String,

    /// JSON payload posted to the destination.
    #[sqlx(json)]
    pub payload: Value,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// Attempts made so far.
    pub attempts: i32,

    /// Error text from the latest failed attempt.
    pub last_error: Option<String>,

    /// Time after which the job is eligible.
    pub next_attempt_at: DateTime<Utc>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryJob {
    /// Attempt count as unsigned.
    pub fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts).unwrap_or(0)
    }

    /// Whether the worker should pick this job up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_eligible() && self.next_attempt_at <= now
    }
}

/// Input for enqueueing a delivery job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Event the job belongs to.
    pub event_id: String,

    /// Destination name.
    pub destination: String,

    /// Target URL.
    pub url: String,

    /// JSON payload.
    pub payload: Value,
}

impl NewJob {
    /// Creates a job submission.
    pub fn new(
        event_id: impl Into<String>,
        destination: impl Into<String>,
        url: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            destination: destination.into(),
            url: url.into(),
            payload,
        }
    }
}

/// Outcome of a failed attempt as persisted by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    /// Attempt count after this failure.
    pub attempts: u32,

    /// `Retry` while budget remains, `Failed` once exhausted.
    pub status: JobStatus,

    /// Rendered error.
    pub last_error: String,

    /// Next due time.
    pub next_attempt_at: DateTime<Utc>,
}

/// Job counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs never attempted.
    pub pending: u64,
    /// Jobs waiting for another attempt.
    pub retry: u64,
    /// Delivered jobs.
    pub ok: u64,
    /// Dead-lettered jobs.
    pub failed: u64,
}

impl QueueStats {
    /// Adds `count` to the bucket for `status`.
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Retry => self.retry += count,
            JobStatus::Ok => self.ok += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    /// Count for one status.
    pub const fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Retry => self.retry,
            JobStatus::Ok => self.ok,
            JobStatus::Failed => self.failed,
        }
    }

    /// Sum across all statuses.
    pub const fn total(&self) -> u64 {
        self.pending + self.retry + self.ok + self.failed
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn job_status_round_trips_through_text() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("delivering".parse::<JobStatus>().is_err());
    }

    #[test]
    fn eligibility_and_terminal_states_are_disjoint() {
        for status in JobStatus::ALL {
            assert_ne!(status.is_eligible(), status.is_terminal());
        }
    }

    #[test]
    fn preview_cuts_on_char_boundary() {
        let long = "é".repeat(BODY_PREVIEW_CHARS + 10);
        let (cut, truncated) = preview(&long);
        assert!(truncated);
        assert_eq!(cut.chars().count(), BODY_PREVIEW_CHARS);

        let (whole, truncated) = preview("{}");
        assert!(!truncated);
        assert_eq!(whole, "{}");
    }

    #[test]
    fn query_limit_is_clamped() {
        assert_eq!(EventQuery::default().effective_limit(), DEFAULT_LIST_LIMIT);
        let big = EventQuery { limit: Some(10_000), ..Default::default() };
        assert_eq!(big.effective_limit(), MAX_LIST_LIMIT);
        let zero = EventQuery { limit: Some(0), ..Default::default() };
        assert_eq!(zero.effective_limit(), 1);
    }

    #[test]
    fn blank_query_is_ignored() {
        let q = EventQuery { query: Some("   ".into()), ..Default::default() };
        assert_eq!(q.needle(), None);
        let q = EventQuery { query: Some(" Lead ".into()), ..Default::default() };
        assert_eq!(q.needle().as_deref(), Some("lead"));
    }

    #[test]
    fn event_matches_across_fields() {
        let event = NewEvent::new("evt_1", "lead.created", "/hooks/form", json!({"email": "A@B.io"}))
            .into_event(Utc::now());
        assert!(event.matches_query("lead"));
        assert!(event.matches_query("hooks"));
        assert!(event.matches_query("a@b.io"));
        assert!(!event.matches_query("invoice"));
    }

    #[test]
    fn new_event_validation() {
        assert!(NewEvent::new("", "t", "/", json!({})).validate().is_err());
        assert!(NewEvent::new("id", " ", "/", json!({})).validate().is_err());
        assert!(NewEvent::new("x".repeat(MAX_EVENT_ID_LEN + 1), "t", "/", json!({}))
            .validate()
            .is_err());
        assert!(NewEvent::new("id", "t", "/", json!({})).validate().is_ok());
    }

    #[test]
    fn queue_stats_accumulate() {
        let mut stats = QueueStats::default();
        stats.add(JobStatus::Pending, 2);
        stats.add(JobStatus::Failed, 1);
        assert_eq!(stats.get(JobStatus::Pending), 2);
        assert_eq!(stats.total(), 3);
    }
}

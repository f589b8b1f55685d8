//! In-process event store for tests and database-less runs.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::EventStore;
use crate::{
    error::{CoreError, Result},
    models::{Event, EventQuery, EventSummary, NewEvent},
};

#[derive(Debug, Default)]
struct Inner {
    events: HashMap<String, (u64, Event)>,
    next_seq: u64,
    fail_with: Option<String>,
}

/// [`EventStore`] held in memory with the same semantics as Postgres.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryEventStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with a database error.
    pub async fn inject_error(&self, message: impl Into<String>) {
        self.inner.write().await.fail_with = Some(message.into());
    }

    /// Clears an injected error.
    pub async fn clear_error(&self) {
        self.inner.write().await.fail_with = None;
    }

    /// Number of stored events.
    pub async fn len(&self) -> usize {
        self.inner.read().await.events.len()
    }

    /// Whether the store holds no events.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn check(inner: &Inner) -> Result<()> {
    match &inner.fail_with {
        Some(message) => Err(CoreError::Database(message.clone())),
        None => Ok(()),
    }
}

impl EventStore for MemoryEventStore {
    fn insert_event(
        &self,
        event: NewEvent,
        ts: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            check(&inner)?;
            if inner.events.contains_key(&event.id) {
                return Ok(false);
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.events.insert(event.id.clone(), (seq, event.into_event(ts)));
            Ok(true)
        })
    }

    fn list_events(
        &self,
        query: EventQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventSummary>>> + Send + '_>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            check(&inner)?;
            let needle = query.needle();
            let limit = usize::try_from(query.effective_limit()).unwrap_or(usize::MAX);

            let mut matches: Vec<&(u64, Event)> = inner
                .events
                .values()
                .filter(|(_, event)| {
                    query.event_type.as_deref().is_none_or(|t| event.event_type == t)
                })
                .filter(|(_, event)| needle.as_deref().is_none_or(|n| event.matches_query(n)))
                .collect();
            matches.sort_by(|(a_seq, a), (b_seq, b)| b.ts.cmp(&a.ts).then(b_seq.cmp(a_seq)));

            Ok(matches.into_iter().take(limit).map(|(_, event)| event.summary()).collect())
        })
    }

    fn find_event(
        &self,
        id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Event>>> + Send + '_>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            check(&inner)?;
            Ok(inner.events.get(&id).map(|(_, event)| event.clone()))
        })
    }

    fn health_check(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { check(&*self.inner.read().await) })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn event(id: &str, event_type: &str, body: serde_json::Value) -> NewEvent {
        NewEvent::new(id, event_type, "/hooks/test", body)
    }

    #[tokio::test]
    async fn duplicate_insert_keeps_first_body() {
        let store = MemoryEventStore::new();
        let now = Utc::now();

        assert!(store.insert_event(event("e1", "lead", json!({"v": 1})), now).await.unwrap());
        assert!(!store.insert_event(event("e1", "lead", json!({"v": 2})), now).await.unwrap());

        let stored = store.find_event("e1".into()).await.unwrap().unwrap();
        assert_eq!(stored.body, json!({"v": 1}));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filtered() {
        let store = MemoryEventStore::new();
        let base = Utc::now();
        store.insert_event(event("a", "lead", json!({})), base).await.unwrap();
        store
            .insert_event(event("b", "call", json!({})), base + Duration::seconds(1))
            .await
            .unwrap();
        store
            .insert_event(event("c", "lead", json!({"name": "Zed"})), base + Duration::seconds(2))
            .await
            .unwrap();

        let all = store.list_events(EventQuery::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["c", "b", "a"]);

        let leads = store
            .list_events(EventQuery { event_type: Some("lead".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(leads.len(), 2);

        let zed = store
            .list_events(EventQuery { query: Some("zED".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(zed.len(), 1);
        assert_eq!(zed[0].id, "c");
    }

    #[tokio::test]
    async fn injected_errors_surface() {
        let store = MemoryEventStore::new();
        store.inject_error("disk full").await;

        let err = store.insert_event(event("x", "t", json!({})), Utc::now()).await.unwrap_err();
        assert!(matches!(err, CoreError::Database(_)));
        assert!(store.health_check().await.is_err());

        store.clear_error().await;
        assert!(store.health_check().await.is_ok());
    }
}

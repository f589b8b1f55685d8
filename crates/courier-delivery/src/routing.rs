//! Maps ingested events to delivery jobs.

use std::collections::BTreeMap;

use courier_core::{Event, NewJob};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{DeliveryError, Result};

/// Event type pattern matching every event.
pub const WILDCARD: &str = "*";

fn match_everything() -> Vec<String> {
    vec![WILDCARD.to_string()]
}

/// One forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination name; selects breaker and bucket.
    pub destination: String,
    /// Target URL.
    pub url: String,
    /// Event types forwarded; `*` forwards every type.
    #[serde(default = "match_everything")]
    pub event_types: Vec<String>,
    /// Static headers sent with every call to this destination.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Route {
    /// Route forwarding every event type.
    pub fn new(destination: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            url: url.into(),
            event_types: match_everything(),
            headers: BTreeMap::new(),
        }
    }

    /// Restricts the route to `types`.
    #[must_use]
    pub fn for_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a static header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Whether events of `event_type` follow this route.
    pub fn matches(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|t| t == WILDCARD || t == event_type)
    }

    /// Rejects routes that could never be delivered.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` for an empty destination or a
    /// URL that is not http(s).
    pub fn validate(&self) -> Result<()> {
        if self.destination.trim().is_empty() {
            return Err(DeliveryError::configuration("route destination must not be empty"));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(DeliveryError::configuration(format!(
                "route {} has invalid url {:?}",
                self.destination, self.url
            )));
        }
        Ok(())
    }
}

/// Rule set applied to every freshly ingested event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventRouter {
    routes: Vec<Route>,
}

impl EventRouter {
    /// Builds a router from validated routes.
    ///
    /// # Errors
    ///
    /// Returns the first route validation error.
    pub fn new(routes: Vec<Route>) -> Result<Self> {
        for route in &routes {
            route.validate()?;
        }
        Ok(Self { routes })
    }

    /// Configured routes.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Jobs to enqueue for `event`, one per matching route.
    pub fn jobs_for(&self, event: &Event) -> Vec<NewJob> {
        let payload = envelope(event);
        self.routes
            .iter()
            .filter(|route| route.matches(&event.event_type))
            .map(|route| {
                NewJob::new(&event.id, &route.destination, &route.url, payload.clone())
            })
            .collect()
    }

    /// Static headers for `destination`, from the first route naming it.
    pub fn headers_for(&self, destination: &str) -> Option<&BTreeMap<String, String>> {
        self.routes
            .iter()
            .find(|route| route.destination == destination)
            .map(|route| &route.headers)
    }
}

/// Payload posted for `event`.
pub fn envelope(event: &Event) -> Value {
    json!({
        "event_id": event.id,
        "type": event.event_type,
        "path": event.path,
        "ts": event.ts,
        "body": event.body,
    })
}

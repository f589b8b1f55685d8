//! Builders for events and jobs used across test suites.

use courier_core::{NewEvent, NewJob};
use serde_json::{json, Value};
use uuid::Uuid;

/// Builder for inbound events.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    id: String,
    event_type: String,
    path: String,
    body: Value,
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuilder {
    /// A `lead.created` event with a random id.
    pub fn new() -> Self {
        Self {
            id: format!("evt_{}", Uuid::new_v4().simple()),
            event_type: "lead.created".to_string(),
            path: "/api/leads".to_string(),
            body: json!({"name": "Ada Lovelace", "email": "ada@example.com"}),
        }
    }

    /// Sets the id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the type.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Sets the originating path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Finishes the event.
    pub fn build(self) -> NewEvent {
        NewEvent::new(self.id, self.event_type, self.path, self.body)
    }
}

/// Job for `destination` at a stub URL.
pub fn job_for(destination: &str) -> NewJob {
    NewJob::new(
        format!("evt_{}", Uuid::new_v4().simple()),
        destination,
        format!("https://{destination}.example.test/hook"),
        json!({"text": format!("hello {destination}")}),
    )
}

//! Raw webhook events and their processing status
//!
//! Events are stored verbatim in the Event Store. Payload normalization
//! into commits and issues happens in [`payload`]; per-event progress
//! through the pipeline is tracked by [`EventStatus`].

pub mod payload;
mod status;

pub use payload::{IssueEvent, ParsedEvent, PayloadError, PushEvent};
pub use status::{EventState, EventStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned by the Event Store, increasing in insertion order
pub type EventId = i64;

/// Event types the pipeline knows how to process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    Push,
    Issues,
    Ping,
    Other(String),
}

impl EventType {
    pub fn from_name(name: &str) -> Self {
        match name {
            "push" => EventType::Push,
            "issues" => EventType::Issues,
            "ping" => EventType::Ping,
            other => EventType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventType::Push => "push",
            EventType::Issues => "issues",
            EventType::Ping => "ping",
            EventType::Other(name) => name,
        }
    }
}

/// An event handed over by the webhook receiver, not yet stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Delivery identifier from the sender, kept for audit only
    #[serde(default)]
    pub delivery_id: Option<String>,
}

impl NewEvent {
    pub fn new(event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            payload,
            delivery_id: None,
        }
    }

    pub fn with_delivery_id(mut self, delivery_id: &str) -> Self {
        self.delivery_id = Some(delivery_id.to_string());
        self
    }
}

/// An immutable, stored event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: String,
    pub delivery_id: Option<String>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl Event {
    pub fn kind(&self) -> EventType {
        EventType::from_name(&self.event_type)
    }

    /// Repository the event belongs to, if the payload names one
    pub fn repo_full_name(&self) -> Option<&str> {
        self.payload
            .get("repository")
            .and_then(|repo| repo.get("full_name"))
            .and_then(|name| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_names() {
        assert_eq!(EventType::from_name("push"), EventType::Push);
        assert_eq!(EventType::from_name("issues"), EventType::Issues);
        assert_eq!(
            EventType::from_name("workflow_run"),
            EventType::Other("workflow_run".to_string())
        );
        assert_eq!(EventType::from_name("workflow_run").as_str(), "workflow_run");
    }

    #[test]
    fn test_repo_full_name() {
        let event = Event {
            id: 1,
            event_type: "push".to_string(),
            delivery_id: None,
            payload: json!({"repository": {"full_name": "acme/widgets"}}),
            received_at: Utc::now(),
        };
        assert_eq!(event.repo_full_name(), Some("acme/widgets"));
    }
}

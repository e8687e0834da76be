//! Per-event pipeline progress

use super::EventId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline state of a single event.
///
/// Success path: `Received -> Linked -> Featurized -> Scored -> Persisted`.
/// `Deferred` and `Failed` are re-claimed after their backoff expires;
/// `Persisted`, `Parked` and `Skipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    Received,
    Linked,
    Featurized,
    Scored,
    Persisted,
    Deferred,
    Failed,
    Parked,
    Skipped,
}

impl EventState {
    pub const ALL: [EventState; 9] = [
        EventState::Received,
        EventState::Linked,
        EventState::Featurized,
        EventState::Scored,
        EventState::Persisted,
        EventState::Deferred,
        EventState::Failed,
        EventState::Parked,
        EventState::Skipped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventState::Received => "received",
            EventState::Linked => "linked",
            EventState::Featurized => "featurized",
            EventState::Scored => "scored",
            EventState::Persisted => "persisted",
            EventState::Deferred => "deferred",
            EventState::Failed => "failed",
            EventState::Parked => "parked",
            EventState::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == value)
    }

    /// Terminal states are never claimed again without operator action
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventState::Persisted | EventState::Parked | EventState::Skipped
        )
    }
}

impl std::fmt::Display for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recorded status of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStatus {
    pub event_id: EventId,
    pub event_type: String,
    pub repo_full_name: String,
    /// Ordering timestamp taken from the payload
    pub event_ts: DateTime<Utc>,
    pub state: EventState,
    pub attempts: u32,
    pub deferrals: u32,
    pub reason: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub lease_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names_round_trip() {
        for state in EventState::ALL {
            assert_eq!(EventState::parse(state.as_str()), Some(state));
        }
        assert_eq!(EventState::parse("unknown"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(EventState::Persisted.is_terminal());
        assert!(EventState::Parked.is_terminal());
        assert!(EventState::Skipped.is_terminal());
        assert!(!EventState::Deferred.is_terminal());
        assert!(!EventState::Failed.is_terminal());
    }
}

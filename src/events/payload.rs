//! Normalization of webhook payloads into repository entities

use super::{Event, EventType};
use crate::model::{Commit, Issue, IssueState, Severity};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors raised while normalizing a payload
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The payload does not match the schema of its event type
    #[error("malformed {event_type} payload: {source}")]
    Malformed {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// The payload parsed but is missing data the pipeline needs
    #[error("invalid {event_type} payload: {detail}")]
    Invalid { event_type: String, detail: String },
}

/// A push event: one or more commits for a repository
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub repo_full_name: String,
    pub commits: Vec<Commit>,
}

/// An issue lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub struct IssueEvent {
    pub repo_full_name: String,
    pub action: String,
    pub issue: Issue,
    /// Issue time the snapshot describes: creation for `opened`, the close
    /// for `closed`, otherwise the payload's `updated_at`
    pub observed_at: DateTime<Utc>,
}

/// Result of normalizing a stored event
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    Push(PushEvent),
    Issue(IssueEvent),
    /// Stored for audit, excluded from feature and prediction steps
    Ignored { reason: String },
}

impl ParsedEvent {
    /// Repository the event belongs to
    pub fn repo_full_name(&self) -> Option<&str> {
        match self {
            ParsedEvent::Push(push) => Some(&push.repo_full_name),
            ParsedEvent::Issue(event) => Some(&event.repo_full_name),
            ParsedEvent::Ignored { .. } => None,
        }
    }

    /// Timestamp used to order events within a repository
    pub fn ordering_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            ParsedEvent::Push(push) => push.commits.iter().map(|c| c.timestamp).min(),
            ParsedEvent::Issue(event) => Some(event.observed_at),
            ParsedEvent::Ignored { .. } => None,
        }
    }
}

/// Normalize a stored event.
///
/// Unknown event types, pings and pull-request issues parse to
/// [`ParsedEvent::Ignored`]; schema violations are errors.
pub fn parse(
    event: &Event,
    label_mapping: &BTreeMap<String, Severity>,
) -> Result<ParsedEvent, PayloadError> {
    match event.kind() {
        EventType::Push => parse_push(event).map(ParsedEvent::Push),
        EventType::Issues => parse_issue(event, label_mapping),
        EventType::Ping => Ok(ParsedEvent::Ignored {
            reason: "ping event".to_string(),
        }),
        EventType::Other(name) => Ok(ParsedEvent::Ignored {
            reason: format!("unsupported event type: {}", name),
        }),
    }
}

/// Map issue labels to a severity using the configured label mapping.
///
/// Labels are compared case-insensitively; the first label (in sorted
/// order) with a mapping wins.
pub fn map_severity(
    labels: &BTreeSet<String>,
    label_mapping: &BTreeMap<String, Severity>,
) -> Option<Severity> {
    labels
        .iter()
        .find_map(|label| label_mapping.get(&label.trim().to_lowercase()).copied())
}

fn parse_push(event: &Event) -> Result<PushEvent, PayloadError> {
    let raw: RawPush = serde_json::from_value(event.payload.clone()).map_err(|source| {
        PayloadError::Malformed {
            event_type: event.event_type.clone(),
            source,
        }
    })?;

    let repo_full_name = raw.repository.full_name;
    let mut commits = Vec::with_capacity(raw.commits.len());

    for commit in raw.commits {
        if commit.id.trim().is_empty() {
            return Err(PayloadError::Invalid {
                event_type: event.event_type.clone(),
                detail: "commit without id".to_string(),
            });
        }

        let files: BTreeSet<String> = commit
            .added
            .into_iter()
            .chain(commit.removed)
            .chain(commit.modified)
            .collect();
        let files_changed = commit
            .stats
            .as_ref()
            .and_then(|s| s.files)
            .unwrap_or(files.len() as u32);

        let author = commit.author.and_then(|a| a.username.or(a.name));
        let pr_number = pr_number_from_message(&commit.message);

        commits.push(Commit {
            sha: commit.id,
            repo_full_name: repo_full_name.clone(),
            author,
            timestamp: commit.timestamp,
            files_changed,
            insertions: commit.stats.as_ref().map(|s| s.additions).unwrap_or(0),
            deletions: commit.stats.as_ref().map(|s| s.deletions).unwrap_or(0),
            pr_number,
            message: commit.message,
            files,
        });
    }

    Ok(PushEvent {
        repo_full_name,
        commits,
    })
}

fn parse_issue(
    event: &Event,
    label_mapping: &BTreeMap<String, Severity>,
) -> Result<ParsedEvent, PayloadError> {
    let raw: RawIssuesEvent = serde_json::from_value(event.payload.clone()).map_err(|source| {
        PayloadError::Malformed {
            event_type: event.event_type.clone(),
            source,
        }
    })?;

    if raw.issue.pull_request.is_some() {
        return Ok(ParsedEvent::Ignored {
            reason: "issue event for a pull request".to_string(),
        });
    }

    // Only the lifecycle actions decide the state; other actions carry it
    let state = match raw.action.as_str() {
        "opened" => IssueState::Open,
        "closed" => IssueState::Closed,
        "reopened" => IssueState::Reopened,
        _ if raw.issue.state == "closed" => IssueState::Closed,
        _ => IssueState::Open,
    };

    let closed_at = if state == IssueState::Closed {
        Some(
            raw.issue
                .closed_at
                .or(raw.issue.updated_at)
                .unwrap_or(event.received_at),
        )
    } else {
        None
    };

    let observed_at = match (raw.action.as_str(), closed_at) {
        ("opened", _) => raw.issue.created_at,
        ("closed", Some(closed)) => closed,
        _ => raw.issue.updated_at.unwrap_or(event.received_at),
    }
    .max(raw.issue.created_at);

    let labels: BTreeSet<String> = raw.issue.labels.into_iter().map(|l| l.name).collect();
    let mapped_severity = map_severity(&labels, label_mapping);

    let issue = Issue {
        id: raw.issue.id,
        repo_full_name: raw.repository.full_name.clone(),
        number: raw.issue.number,
        title: raw.issue.title,
        body: raw.issue.body.unwrap_or_default(),
        labels,
        mapped_severity,
        state,
        created_at: raw.issue.created_at,
        closed_at,
    };

    Ok(ParsedEvent::Issue(IssueEvent {
        repo_full_name: raw.repository.full_name,
        action: raw.action,
        issue,
        observed_at,
    }))
}

/// Extract the pull request number from a merge commit message
fn pr_number_from_message(message: &str) -> Option<u64> {
    let rest = message.strip_prefix("Merge pull request #")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

// Wire types

#[derive(Debug, Deserialize)]
struct RawRepository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct RawPush {
    repository: RawRepository,
    #[serde(default)]
    commits: Vec<RawCommit>,
}

#[derive(Debug, Deserialize)]
struct RawCommit {
    id: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    author: Option<RawAuthor>,
    #[serde(default)]
    added: Vec<String>,
    #[serde(default)]
    removed: Vec<String>,
    #[serde(default)]
    modified: Vec<String>,
    #[serde(default)]
    stats: Option<RawStats>,
}

#[derive(Debug, Deserialize)]
struct RawAuthor {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStats {
    #[serde(default)]
    additions: u32,
    #[serde(default)]
    deletions: u32,
    #[serde(default)]
    files: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawIssuesEvent {
    action: String,
    repository: RawRepository,
    issue: RawIssue,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    id: i64,
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<RawLabel>,
    #[serde(default = "default_issue_state")]
    state: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    name: String,
}

fn default_issue_state() -> String {
    "open".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, payload: serde_json::Value) -> Event {
        Event {
            id: 1,
            event_type: event_type.to_string(),
            delivery_id: None,
            payload,
            received_at: Utc::now(),
        }
    }

    fn mapping() -> BTreeMap<String, Severity> {
        let mut mapping = BTreeMap::new();
        mapping.insert("critical".to_string(), Severity::Critical);
        mapping.insert("bug".to_string(), Severity::Medium);
        mapping
    }

    #[test]
    fn test_parse_push() {
        let payload = json!({
            "repository": {"full_name": "acme/widgets"},
            "commits": [{
                "id": "abc123",
                "timestamp": "2025-01-01T12:00:00Z",
                "message": "Merge pull request #12 from acme/fix",
                "author": {"username": "alice"},
                "added": ["a.rs"],
                "modified": ["b.rs", "a.rs"],
                "stats": {"additions": 10, "deletions": 3}
            }]
        });

        let parsed = parse(&event("push", payload), &mapping()).unwrap();
        let ParsedEvent::Push(push) = parsed else {
            panic!("expected push");
        };

        assert_eq!(push.repo_full_name, "acme/widgets");
        let commit = &push.commits[0];
        assert_eq!(commit.sha, "abc123");
        assert_eq!(commit.author.as_deref(), Some("alice"));
        assert_eq!(commit.files_changed, 2);
        assert!(commit.files.contains("a.rs") && commit.files.contains("b.rs"));
        assert_eq!(commit.insertions, 10);
        assert_eq!(commit.deletions, 3);
        assert_eq!(commit.pr_number, Some(12));
    }

    #[test]
    fn test_parse_issue_closed() {
        let payload = json!({
            "action": "closed",
            "repository": {"full_name": "acme/widgets"},
            "issue": {
                "id": 900,
                "number": 42,
                "title": "Crash on start",
                "labels": [{"name": "Critical"}],
                "state": "closed",
                "created_at": "2025-01-01T00:00:00Z",
                "closed_at": "2025-01-05T00:00:00Z"
            }
        });

        let parsed = parse(&event("issues", payload), &mapping()).unwrap();
        let ParsedEvent::Issue(issue_event) = parsed else {
            panic!("expected issue");
        };

        assert_eq!(issue_event.issue.state, IssueState::Closed);
        assert_eq!(issue_event.issue.mapped_severity, Some(Severity::Critical));
        assert!(issue_event.issue.closed_at.is_some());
    }

    #[test]
    fn test_unknown_event_type_is_ignored() {
        let parsed = parse(&event("deployment", json!({})), &mapping()).unwrap();
        assert!(matches!(parsed, ParsedEvent::Ignored { .. }));
    }

    #[test]
    fn test_malformed_push() {
        let result = parse(&event("push", json!({"commits": "nope"})), &mapping());
        assert!(matches!(result, Err(PayloadError::Malformed { .. })));
    }

    #[test]
    fn test_push_ordering_timestamp_is_earliest_commit() {
        let payload = json!({
            "repository": {"full_name": "acme/widgets"},
            "commits": [
                {"id": "b", "timestamp": "2025-01-02T00:00:00Z", "message": ""},
                {"id": "a", "timestamp": "2025-01-01T00:00:00Z", "message": ""}
            ]
        });
        let parsed = parse(&event("push", payload), &mapping()).unwrap();
        let ts = parsed.ordering_timestamp().unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_late_opened_snapshot_stays_open() {
        let payload = json!({
            "action": "opened",
            "repository": {"full_name": "acme/widgets"},
            "issue": {
                "id": 900,
                "number": 42,
                "state": "closed",
                "created_at": "2025-01-01T00:00:00Z",
                "updated_at": "2025-01-05T00:00:00Z",
                "closed_at": "2025-01-05T00:00:00Z"
            }
        });

        let parsed = parse(&event("issues", payload), &mapping()).unwrap();
        let ParsedEvent::Issue(issue_event) = parsed else {
            panic!("expected issue");
        };

        assert_eq!(issue_event.issue.state, IssueState::Open);
        assert!(issue_event.issue.closed_at.is_none());
        assert_eq!(issue_event.observed_at, issue_event.issue.created_at);
    }

    #[test]
    fn test_relabel_observed_at_update_time() {
        let payload = json!({
            "action": "labeled",
            "repository": {"full_name": "acme/widgets"},
            "issue": {
                "id": 900,
                "number": 42,
                "labels": [{"name": "bug"}],
                "created_at": "2025-01-01T00:00:00Z",
                "updated_at": "2025-01-07T00:00:00Z"
            }
        });

        let parsed = parse(&event("issues", payload), &mapping()).unwrap();
        let ts = parsed.ordering_timestamp().unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-01-07T00:00:00+00:00");
    }
}

//! Normalized repository entities and pipeline results
//!
//! These are the rows the pipeline reads and writes:
//! - Commits and issues as delivered by webhook events
//! - Commit/issue links resolved from free-text references
//! - Feature records and predictions keyed by commit SHA

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Ordered mapping of feature name to value
pub type FeatureVector = BTreeMap<String, f64>;

/// Severity classes, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Numeric rank used in feature vectors (low = 1 .. critical = 4)
    pub fn rank(self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Parse a severity name, accepting single-letter abbreviations
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "low" | "l" => Some(Severity::Low),
            "medium" | "m" => Some(Severity::Medium),
            "high" | "h" => Some(Severity::High),
            "critical" | "c" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Whether this severity counts toward "severe issue" aggregates
    pub fn is_severe(self) -> bool {
        self >= Severity::High
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A commit as stored in the repository tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub repo_full_name: String,
    pub author: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
    pub pr_number: Option<u64>,
    /// Paths touched by the commit, when the payload lists them
    #[serde(default)]
    pub files: BTreeSet<String>,
}

/// Lifecycle state of an issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Reopened,
    Closed,
}

impl IssueState {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueState::Open => "open",
            IssueState::Reopened => "reopened",
            IssueState::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(IssueState::Open),
            "reopened" => Some(IssueState::Reopened),
            "closed" => Some(IssueState::Closed),
            _ => None,
        }
    }
}

/// An issue as stored in the repository tables.
///
/// The row holds the snapshot observed last in issue time. Earlier states
/// and severities stay queryable through the issue's transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub repo_full_name: String,
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: BTreeSet<String>,
    pub mapped_severity: Option<Severity>,
    pub state: IssueState,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Relation between a commit and an issue, ordered by strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    References,
    Closes,
    Fixes,
}

impl LinkType {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkType::References => "references",
            LinkType::Closes => "closes",
            LinkType::Fixes => "fixes",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "references" => Some(LinkType::References),
            "closes" => Some(LinkType::Closes),
            "fixes" => Some(LinkType::Fixes),
            _ => None,
        }
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A commit-issue link.
///
/// Links are keyed by `(commit_sha, issue_number)`; a commit belongs to a
/// single repository so the number identifies the issue. `issue_id` stays
/// empty while the referenced issue has not been delivered yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitIssueLink {
    pub commit_sha: String,
    pub repo_full_name: String,
    pub issue_number: u64,
    pub issue_id: Option<i64>,
    pub link_type: LinkType,
}

impl CommitIssueLink {
    pub fn is_pending(&self) -> bool {
        self.issue_id.is_none()
    }
}

/// Feature vector computed for a commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub commit_sha: String,
    pub feature_vector: FeatureVector,
    /// SHA-256 over the canonical JSON encoding of `feature_vector`
    pub vector_hash: String,
    pub generated_at: DateTime<Utc>,
}

/// Latest prediction for a commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub commit_sha: String,
    pub predicted_class: String,
    pub severity_score: f64,
    pub probability_distribution: BTreeMap<String, f64>,
    pub model_version: String,
    /// Hash of the feature vector the prediction was computed from
    pub feature_hash: String,
    /// Number of times this row has been written
    pub revision: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_strength_ordering() {
        assert!(LinkType::Fixes > LinkType::Closes);
        assert!(LinkType::Closes > LinkType::References);
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("H"), Some(Severity::High));
        assert_eq!(Severity::parse(" Critical "), Some(Severity::Critical));
        assert_eq!(Severity::parse("urgent"), None);
        assert!(Severity::High.is_severe());
        assert!(!Severity::Medium.is_severe());
    }
}

//! Database schema definition

/// SQL schema for the BugSage database.
///
/// Timestamps are stored as fixed-width RFC 3339 text in UTC (microsecond
/// precision), so lexical order equals chronological order.
pub const SCHEMA: &str = r#"
-- Append-only log of raw webhook payloads
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    delivery_id TEXT,
    payload TEXT NOT NULL,
    received_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);

-- Pipeline progress per event
CREATE TABLE IF NOT EXISTS event_status (
    event_id INTEGER PRIMARY KEY,
    event_type TEXT NOT NULL,
    repo_full_name TEXT NOT NULL,
    event_ts TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    deferrals INTEGER NOT NULL DEFAULT 0,
    reason TEXT,
    next_attempt_at TEXT NOT NULL,
    lease_until TEXT,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (event_id) REFERENCES events(id)
);

CREATE INDEX IF NOT EXISTS idx_event_status_due ON event_status(state, next_attempt_at);
CREATE INDEX IF NOT EXISTS idx_event_status_repo ON event_status(repo_full_name, event_ts);

-- Coordinator read position in the event log
CREATE TABLE IF NOT EXISTS pipeline_cursor (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_event_id INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS commits (
    sha TEXT PRIMARY KEY,
    repo_full_name TEXT NOT NULL,
    author TEXT,
    timestamp TEXT NOT NULL,
    message TEXT NOT NULL,
    files_changed INTEGER NOT NULL DEFAULT 0,
    insertions INTEGER NOT NULL DEFAULT 0,
    deletions INTEGER NOT NULL DEFAULT 0,
    pr_number INTEGER,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_commits_repo_ts ON commits(repo_full_name, timestamp);
CREATE INDEX IF NOT EXISTS idx_commits_author_ts ON commits(repo_full_name, author, timestamp);

-- Paths touched by each commit
CREATE TABLE IF NOT EXISTS commit_files (
    commit_sha TEXT NOT NULL,
    path TEXT NOT NULL,
    PRIMARY KEY (commit_sha, path),
    FOREIGN KEY (commit_sha) REFERENCES commits(sha) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_commit_files_path ON commit_files(path);

CREATE TABLE IF NOT EXISTS issues (
    id INTEGER PRIMARY KEY,
    repo_full_name TEXT NOT NULL,
    number INTEGER NOT NULL,
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    labels_json TEXT NOT NULL,
    mapped_severity TEXT,
    state TEXT NOT NULL,
    created_at TEXT NOT NULL,
    closed_at TEXT,
    -- Issue time of the snapshot this row holds
    observed_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_issues_repo_number ON issues(repo_full_name, number);
CREATE INDEX IF NOT EXISTS idx_issues_repo_created ON issues(repo_full_name, created_at);

-- State and severity of an issue from `at` until its next transition
CREATE TABLE IF NOT EXISTS issue_transitions (
    issue_id INTEGER NOT NULL,
    at TEXT NOT NULL,
    state TEXT NOT NULL,
    mapped_severity TEXT,
    closed_at TEXT,
    PRIMARY KEY (issue_id, at)
);

-- Commit <-> issue references; issue_id is NULL while the link is pending
CREATE TABLE IF NOT EXISTS commit_issue_link (
    commit_sha TEXT NOT NULL,
    repo_full_name TEXT NOT NULL,
    issue_number INTEGER NOT NULL,
    issue_id INTEGER,
    link_type TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (commit_sha, issue_number),
    FOREIGN KEY (commit_sha) REFERENCES commits(sha) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_links_issue ON commit_issue_link(issue_id);
CREATE INDEX IF NOT EXISTS idx_links_pending ON commit_issue_link(repo_full_name, issue_number);

CREATE TABLE IF NOT EXISTS features (
    commit_sha TEXT PRIMARY KEY,
    feature_vector TEXT NOT NULL,
    vector_hash TEXT NOT NULL,
    generated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS predictions (
    commit_sha TEXT PRIMARY KEY,
    predicted_class TEXT NOT NULL,
    severity_score REAL NOT NULL,
    probability_distribution TEXT NOT NULL,
    model_version TEXT NOT NULL,
    feature_hash TEXT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_predictions_created ON predictions(created_at);
CREATE INDEX IF NOT EXISTS idx_predictions_model ON predictions(model_version);
"#;

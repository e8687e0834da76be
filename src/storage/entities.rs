//! Commits, issues, links and the causal-slice queries over them

use super::{parse_opt_ts, parse_ts, ts, Database, Result, StorageError};
use crate::model::{Commit, CommitIssueLink, Issue, IssueState, LinkType, Severity};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;

const COMMIT_COLUMNS: &str = "sha, repo_full_name, author, timestamp, message, files_changed, \
     insertions, deletions, pr_number";

const ISSUE_COLUMNS: &str = "id, repo_full_name, number, title, body, labels_json, \
     mapped_severity, state, created_at, closed_at";

/// Commit attributes used by windowed aggregates
#[derive(Debug, Clone, PartialEq)]
pub struct CommitPoint {
    pub sha: String,
    pub timestamp: DateTime<Utc>,
    pub author: Option<String>,
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

/// Issue attributes used by windowed aggregates
#[derive(Debug, Clone, PartialEq)]
pub struct IssuePoint {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub mapped_severity: Option<Severity>,
}

/// A resolved link from a commit to an issue
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedIssue {
    pub issue_number: u64,
    pub link_type: LinkType,
    pub mapped_severity: Option<Severity>,
    pub created_at: DateTime<Utc>,
}

/// A commit that touched a given path
#[derive(Debug, Clone, PartialEq)]
pub struct FileTouch {
    pub sha: String,
    pub timestamp: DateTime<Utc>,
}

/// Latest transition of each issue at or before `?2`
const TRANSITION_AS_OF: &str = "LEFT JOIN issue_transitions t ON t.issue_id = i.id AND t.at = (\
     SELECT MAX(t2.at) FROM issue_transitions t2 WHERE t2.issue_id = i.id AND t2.at <= ?2)";

impl Database {
    // ==================== Commits ====================

    /// Insert or update a commit and its touched paths (last write wins)
    pub fn upsert_commit(&self, commit: &Commit) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO commits (
                sha, repo_full_name, author, timestamp, message, files_changed,
                insertions, deletions, pr_number, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(sha) DO UPDATE SET
                repo_full_name = excluded.repo_full_name,
                author = excluded.author,
                timestamp = excluded.timestamp,
                message = excluded.message,
                files_changed = excluded.files_changed,
                insertions = excluded.insertions,
                deletions = excluded.deletions,
                pr_number = excluded.pr_number,
                updated_at = excluded.updated_at
            "#,
            params![
                commit.sha,
                commit.repo_full_name,
                commit.author,
                ts(&commit.timestamp),
                commit.message,
                commit.files_changed,
                commit.insertions,
                commit.deletions,
                commit.pr_number.map(|n| n as i64),
                ts(&Utc::now()),
            ],
        )?;

        tx.execute(
            "DELETE FROM commit_files WHERE commit_sha = ?1",
            params![commit.sha],
        )?;
        for path in &commit.files {
            tx.execute(
                "INSERT INTO commit_files (commit_sha, path) VALUES (?1, ?2)",
                params![commit.sha, path],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Get a commit by SHA
    pub fn get_commit(&self, sha: &str) -> Result<Option<Commit>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM commits WHERE sha = ?1", COMMIT_COLUMNS),
                params![sha],
                CommitRow::from_row,
            )
            .optional()?;

        row.map(|row| row.into_commit_with_files(&conn)).transpose()
    }

    /// Commits of a repository with `timestamp >= since` that already have
    /// a feature record, oldest first
    pub fn featurized_commits_since(
        &self,
        repo_full_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Commit>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT c.sha, c.repo_full_name, c.author, c.timestamp, c.message, c.files_changed,
                   c.insertions, c.deletions, c.pr_number
            FROM commits c JOIN features f ON f.commit_sha = c.sha
            WHERE c.repo_full_name = ?1 AND c.timestamp >= ?2
            ORDER BY c.timestamp, c.sha
            "#,
        )?;

        let rows = stmt.query_map(params![repo_full_name, ts(&since)], CommitRow::from_row)?;

        let rows = rows.collect::<rusqlite::Result<Vec<CommitRow>>>()?;
        let mut commits = Vec::with_capacity(rows.len());
        for row in rows {
            commits.push(row.into_commit_with_files(&conn)?);
        }

        Ok(commits)
    }

    /// Commits of a repository with `from <= timestamp <= to`, excluding one
    /// SHA, oldest first
    pub fn commit_points(
        &self,
        repo_full_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        exclude_sha: &str,
    ) -> Result<Vec<CommitPoint>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT sha, timestamp, author, files_changed, insertions, deletions
            FROM commits
            WHERE repo_full_name = ?1 AND timestamp >= ?2 AND timestamp <= ?3 AND sha != ?4
            ORDER BY timestamp, sha
            "#,
        )?;

        let rows = stmt.query_map(
            params![repo_full_name, ts(&from), ts(&to), exclude_sha],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, u32>(5)?,
                ))
            },
        )?;

        let mut points = Vec::new();
        for row in rows {
            let (sha, timestamp, author, files_changed, insertions, deletions) = row?;
            points.push(CommitPoint {
                sha,
                timestamp: parse_ts("commits", &timestamp)?,
                author,
                files_changed,
                insertions,
                deletions,
            });
        }

        Ok(points)
    }

    /// Count commits of a repository (optionally by one author) with
    /// `timestamp <= to`, excluding one SHA
    pub fn count_commits_until(
        &self,
        repo_full_name: &str,
        author: Option<&str>,
        to: DateTime<Utc>,
        exclude_sha: &str,
    ) -> Result<usize> {
        let count: i64 = self.conn()?.query_row(
            r#"
            SELECT COUNT(*) FROM commits
            WHERE repo_full_name = ?1 AND timestamp <= ?2 AND sha != ?3
              AND (?4 IS NULL OR author = ?4)
            "#,
            params![repo_full_name, ts(&to), exclude_sha, author],
            |row| row.get(0),
        )?;

        Ok(count as usize)
    }

    /// Commits of a repository that touched `path` with `timestamp <= to`,
    /// excluding one SHA, oldest first
    pub fn file_touches(
        &self,
        repo_full_name: &str,
        path: &str,
        to: DateTime<Utc>,
        exclude_sha: &str,
    ) -> Result<Vec<FileTouch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT c.sha, c.timestamp
            FROM commit_files f JOIN commits c ON c.sha = f.commit_sha
            WHERE f.path = ?1 AND c.repo_full_name = ?2 AND c.timestamp <= ?3 AND c.sha != ?4
            ORDER BY c.timestamp, c.sha
            "#,
        )?;

        let rows = stmt.query_map(params![path, repo_full_name, ts(&to), exclude_sha], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut touches = Vec::new();
        for row in rows {
            let (sha, timestamp) = row?;
            touches.push(FileTouch {
                sha,
                timestamp: parse_ts("commits", &timestamp)?,
            });
        }

        Ok(touches)
    }

    // ==================== Issues ====================

    /// Record an issue snapshot observed at `observed_at` (issue time).
    ///
    /// The snapshot is kept as a transition of the issue's state and
    /// severity. The issue row only takes the snapshot when it is at least
    /// as recent as the one already stored, so late deliveries never roll
    /// the row back. Returns whether the row was updated.
    pub fn upsert_issue(&self, issue: &Issue, observed_at: DateTime<Utc>) -> Result<bool> {
        let labels_json = serde_json::to_string(&issue.labels)?;
        let severity = issue.mapped_severity.map(|s| s.as_str());
        let observed_at = observed_at.max(issue.created_at);

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        // Issues first seen in a later state are assumed open since creation
        tx.execute(
            r#"
            INSERT OR IGNORE INTO issue_transitions (issue_id, at, state, mapped_severity, closed_at)
            VALUES (?1, ?2, 'open', ?3, NULL)
            "#,
            params![issue.id, ts(&issue.created_at), severity],
        )?;
        tx.execute(
            r#"
            INSERT OR REPLACE INTO issue_transitions (issue_id, at, state, mapped_severity, closed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                issue.id,
                ts(&observed_at),
                issue.state.as_str(),
                severity,
                issue.closed_at.as_ref().map(ts),
            ],
        )?;

        let applied = tx.execute(
            r#"
            INSERT INTO issues (
                id, repo_full_name, number, title, body, labels_json,
                mapped_severity, state, created_at, closed_at, observed_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                repo_full_name = excluded.repo_full_name,
                number = excluded.number,
                title = excluded.title,
                body = excluded.body,
                labels_json = excluded.labels_json,
                mapped_severity = excluded.mapped_severity,
                state = excluded.state,
                created_at = excluded.created_at,
                closed_at = excluded.closed_at,
                observed_at = excluded.observed_at,
                updated_at = excluded.updated_at
            WHERE excluded.observed_at >= issues.observed_at
            "#,
            params![
                issue.id,
                issue.repo_full_name,
                issue.number as i64,
                issue.title,
                issue.body,
                labels_json,
                severity,
                issue.state.as_str(),
                ts(&issue.created_at),
                issue.closed_at.as_ref().map(ts),
                ts(&observed_at),
                ts(&Utc::now()),
            ],
        )?;

        tx.commit()?;
        Ok(applied > 0)
    }

    /// Get an issue by id
    pub fn get_issue(&self, id: i64) -> Result<Option<Issue>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM issues WHERE id = ?1", ISSUE_COLUMNS),
                params![id],
                IssueRow::from_row,
            )
            .optional()?;

        row.map(IssueRow::into_issue).transpose()
    }

    /// Find an issue by repository and number
    pub fn find_issue(&self, repo_full_name: &str, number: u64) -> Result<Option<Issue>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM issues WHERE repo_full_name = ?1 AND number = ?2",
                    ISSUE_COLUMNS
                ),
                params![repo_full_name, number as i64],
                IssueRow::from_row,
            )
            .optional()?;

        row.map(IssueRow::into_issue).transpose()
    }

    /// Issues of a repository created at or before `to`, oldest first,
    /// with the state and severity they had at `to`
    pub fn issue_points(&self, repo_full_name: &str, to: DateTime<Utc>) -> Result<Vec<IssuePoint>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT i.id, i.created_at, t.state, t.mapped_severity, t.closed_at, t.at
            FROM issues i {}
            WHERE i.repo_full_name = ?1 AND i.created_at <= ?2
            ORDER BY i.created_at, i.id
            "#,
            TRANSITION_AS_OF
        ))?;

        let rows = stmt.query_map(params![repo_full_name, ts(&to)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut points = Vec::new();
        for row in rows {
            let (id, created_at, state, severity, closed_at, at) = row?;
            let closed = match state.as_deref() {
                Some(state) => {
                    IssueState::parse(state).ok_or_else(|| {
                        StorageError::corrupt("issue_transitions", format!("state {:?}", state))
                    })? == IssueState::Closed
                }
                None => false,
            };

            points.push(IssuePoint {
                id,
                created_at: parse_ts("issues", &created_at)?,
                closed_at: if closed {
                    parse_opt_ts("issue_transitions", closed_at.or(at))?
                } else {
                    None
                },
                mapped_severity: parse_severity(severity)?,
            });
        }

        Ok(points)
    }

    // ==================== Links ====================

    /// Replace the links of a commit with a freshly resolved set.
    ///
    /// Links for the same `(commit, issue)` pair are overwritten; links no
    /// longer present in the commit message are removed.
    pub fn replace_commit_links(&self, commit_sha: &str, links: &[CommitIssueLink]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = ts(&Utc::now());

        let keep: BTreeSet<i64> = links.iter().map(|l| l.issue_number as i64).collect();
        let existing: Vec<i64> = {
            let mut stmt =
                tx.prepare("SELECT issue_number FROM commit_issue_link WHERE commit_sha = ?1")?;
            let rows = stmt.query_map(params![commit_sha], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<i64>>>()?
        };

        for number in existing.iter().filter(|n| !keep.contains(n)) {
            tx.execute(
                "DELETE FROM commit_issue_link WHERE commit_sha = ?1 AND issue_number = ?2",
                params![commit_sha, number],
            )?;
        }

        for link in links {
            tx.execute(
                r#"
                INSERT INTO commit_issue_link (
                    commit_sha, repo_full_name, issue_number, issue_id, link_type, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(commit_sha, issue_number) DO UPDATE SET
                    repo_full_name = excluded.repo_full_name,
                    issue_id = COALESCE(excluded.issue_id, commit_issue_link.issue_id),
                    link_type = excluded.link_type,
                    updated_at = excluded.updated_at
                "#,
                params![
                    link.commit_sha,
                    link.repo_full_name,
                    link.issue_number as i64,
                    link.issue_id,
                    link.link_type.as_str(),
                    now,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Get all links of a commit, ordered by issue number
    pub fn links_for_commit(&self, commit_sha: &str) -> Result<Vec<CommitIssueLink>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT commit_sha, repo_full_name, issue_number, issue_id, link_type
            FROM commit_issue_link WHERE commit_sha = ?1
            ORDER BY issue_number
            "#,
        )?;

        let rows = stmt.query_map(params![commit_sha], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut links = Vec::new();
        for row in rows {
            let (commit_sha, repo_full_name, issue_number, issue_id, link_type) = row?;
            let link_type = LinkType::parse(&link_type).ok_or_else(|| {
                StorageError::corrupt("commit_issue_link", format!("link type {:?}", link_type))
            })?;
            links.push(CommitIssueLink {
                commit_sha,
                repo_full_name,
                issue_number: issue_number as u64,
                issue_id,
                link_type,
            });
        }

        Ok(links)
    }

    /// Attach an arrived issue to every link waiting on its number
    pub fn resolve_pending_links(
        &self,
        repo_full_name: &str,
        issue_number: u64,
        issue_id: i64,
    ) -> Result<usize> {
        let resolved = self.conn()?.execute(
            r#"
            UPDATE commit_issue_link SET issue_id = ?1, updated_at = ?2
            WHERE repo_full_name = ?3 AND issue_number = ?4
              AND (issue_id IS NULL OR issue_id != ?1)
            "#,
            params![issue_id, ts(&Utc::now()), repo_full_name, issue_number as i64],
        )?;

        Ok(resolved)
    }

    /// Resolved links of a commit whose issue was created at or before `to`,
    /// with the severity the issue had at `to`
    pub fn linked_issues(&self, commit_sha: &str, to: DateTime<Utc>) -> Result<Vec<LinkedIssue>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT l.issue_number, l.link_type, t.mapped_severity, i.created_at
            FROM commit_issue_link l JOIN issues i ON i.id = l.issue_id {}
            WHERE l.commit_sha = ?1 AND i.created_at <= ?2
            ORDER BY l.issue_number
            "#,
            TRANSITION_AS_OF
        ))?;

        let rows = stmt.query_map(params![commit_sha, ts(&to)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut linked = Vec::new();
        for row in rows {
            let (issue_number, link_type, severity, created_at) = row?;
            linked.push(LinkedIssue {
                issue_number: issue_number as u64,
                link_type: LinkType::parse(&link_type).ok_or_else(|| {
                    StorageError::corrupt("commit_issue_link", format!("link type {:?}", link_type))
                })?,
                mapped_severity: parse_severity(severity)?,
                created_at: parse_ts("issues", &created_at)?,
            });
        }

        Ok(linked)
    }
}

fn parse_severity(value: Option<String>) -> Result<Option<Severity>> {
    value
        .map(|s| {
            Severity::parse(&s)
                .ok_or_else(|| StorageError::corrupt("issues", format!("severity {:?}", s)))
        })
        .transpose()
}

// Internal row types for database mapping

struct CommitRow {
    sha: String,
    repo_full_name: String,
    author: Option<String>,
    timestamp: String,
    message: String,
    files_changed: u32,
    insertions: u32,
    deletions: u32,
    pr_number: Option<i64>,
}

impl CommitRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sha: row.get(0)?,
            repo_full_name: row.get(1)?,
            author: row.get(2)?,
            timestamp: row.get(3)?,
            message: row.get(4)?,
            files_changed: row.get(5)?,
            insertions: row.get(6)?,
            deletions: row.get(7)?,
            pr_number: row.get(8)?,
        })
    }

    fn into_commit(self) -> Result<Commit> {
        Ok(Commit {
            timestamp: parse_ts("commits", &self.timestamp)?,
            sha: self.sha,
            repo_full_name: self.repo_full_name,
            author: self.author,
            message: self.message,
            files_changed: self.files_changed,
            insertions: self.insertions,
            deletions: self.deletions,
            pr_number: self.pr_number.map(|n| n as u64),
            files: BTreeSet::new(),
        })
    }

    fn into_commit_with_files(self, conn: &Connection) -> Result<Commit> {
        let mut stmt =
            conn.prepare_cached("SELECT path FROM commit_files WHERE commit_sha = ?1 ORDER BY path")?;
        let files = stmt
            .query_map(params![self.sha], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<BTreeSet<String>>>()?;

        let mut commit = self.into_commit()?;
        commit.files = files;
        Ok(commit)
    }
}

struct IssueRow {
    id: i64,
    repo_full_name: String,
    number: i64,
    title: String,
    body: String,
    labels_json: String,
    mapped_severity: Option<String>,
    state: String,
    created_at: String,
    closed_at: Option<String>,
}

impl IssueRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo_full_name: row.get(1)?,
            number: row.get(2)?,
            title: row.get(3)?,
            body: row.get(4)?,
            labels_json: row.get(5)?,
            mapped_severity: row.get(6)?,
            state: row.get(7)?,
            created_at: row.get(8)?,
            closed_at: row.get(9)?,
        })
    }

    fn into_issue(self) -> Result<Issue> {
        let state = IssueState::parse(&self.state)
            .ok_or_else(|| StorageError::corrupt("issues", format!("state {:?}", self.state)))?;

        Ok(Issue {
            id: self.id,
            repo_full_name: self.repo_full_name,
            number: self.number as u64,
            title: self.title,
            body: self.body,
            labels: serde_json::from_str(&self.labels_json)?,
            mapped_severity: parse_severity(self.mapped_severity)?,
            state,
            created_at: parse_ts("issues", &self.created_at)?,
            closed_at: parse_opt_ts("issues", self.closed_at)?,
        })
    }
}

//! History backfill
//!
//! Walks a local Git repository and turns its history into synthetic
//! `push` events, so historic commits flow through the same pipeline as
//! live webhook deliveries. Issues come from the GitHub API or an export
//! file, see [`issues`].

pub mod issues;

pub use issues::{backfill_issues, read_issues_file, GitHubClient};

use crate::events::{EventId, NewEvent};
use crate::storage::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use git2::{Repository as GitRepo, Sort};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A commit read from local Git history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricCommit {
    pub sha: String,
    pub author: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
    /// Paths touched, sorted
    pub files: Vec<String>,
}

/// Read-only view of a local Git repository
pub struct GitHistory {
    repo: GitRepo,
    root: PathBuf,
}

impl GitHistory {
    /// Open the repository containing `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let repo = GitRepo::discover(path)
            .with_context(|| format!("Failed to open Git repository at {:?}", path))?;

        let root = repo
            .workdir()
            .unwrap_or_else(|| repo.path())
            .to_path_buf();

        Ok(Self { repo, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Non-merge commits reachable from HEAD, oldest first
    pub fn commits(&self, since: Option<DateTime<Utc>>) -> Result<Vec<HistoricCommit>> {
        let mut walk = self.repo.revwalk().context("Failed to create revwalk")?;
        walk.push_head().context("Failed to read HEAD")?;
        walk.set_sorting(Sort::TIME | Sort::REVERSE)
            .context("Failed to sort revwalk")?;

        let mut commits = Vec::new();
        for oid in walk {
            let oid = oid.context("Failed to walk history")?;
            let commit = self
                .repo
                .find_commit(oid)
                .with_context(|| format!("Failed to load commit {}", oid))?;

            if commit.parent_count() > 1 {
                continue;
            }

            let timestamp = DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0)
                .with_context(|| format!("Commit {} has an invalid timestamp", oid))?;
            if since.is_some_and(|since| timestamp < since) {
                continue;
            }

            let (files_changed, insertions, deletions, files) = self.diff_stats(&commit)?;

            commits.push(HistoricCommit {
                sha: oid.to_string(),
                author: commit.author().name().map(str::to_string),
                timestamp,
                message: commit.message().unwrap_or_default().trim_end().to_string(),
                files_changed,
                insertions,
                deletions,
                files,
            });
        }

        debug!(root = %self.root.display(), commits = commits.len(), "Read git history");
        Ok(commits)
    }

    fn diff_stats(&self, commit: &git2::Commit<'_>) -> Result<(u32, u32, u32, Vec<String>)> {
        let tree = commit.tree().context("Failed to get commit tree")?;
        let parent_tree = match commit.parent_count() {
            0 => None,
            _ => Some(
                commit
                    .parent(0)
                    .and_then(|p| p.tree())
                    .context("Failed to get parent tree")?,
            ),
        };

        let diff = self
            .repo
            .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)
            .context("Failed to compute diff")?;
        let stats = diff.stats().context("Failed to compute diff stats")?;

        let mut files: Vec<String> = diff
            .deltas()
            .filter_map(|delta| delta.new_file().path().or_else(|| delta.old_file().path()))
            .map(|path| path.to_string_lossy().into_owned())
            .collect();
        files.sort();
        files.dedup();

        Ok((
            stats.files_changed() as u32,
            stats.insertions() as u32,
            stats.deletions() as u32,
            files,
        ))
    }
}

/// Build a `push` payload carrying the given commits
pub fn push_payload(repo_full_name: &str, commits: &[HistoricCommit]) -> Value {
    let commits: Vec<Value> = commits
        .iter()
        .map(|c| {
            json!({
                "id": c.sha,
                "timestamp": c.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                "message": c.message,
                "author": { "name": c.author },
                "modified": c.files,
                "stats": {
                    "additions": c.insertions,
                    "deletions": c.deletions,
                    "files": c.files_changed,
                },
            })
        })
        .collect();

    json!({
        "ref": "refs/heads/backfill",
        "repository": { "full_name": repo_full_name },
        "commits": commits,
    })
}

/// Append the history of a Git repository to the Event Store as push
/// events of at most `batch_size` commits each.
///
/// Returns the ids of the appended events.
pub fn backfill(
    db: &Database,
    history: &GitHistory,
    repo_full_name: &str,
    since: Option<DateTime<Utc>>,
    batch_size: usize,
) -> Result<Vec<EventId>> {
    let commits = history.commits(since)?;
    let mut ids = Vec::new();

    for chunk in commits.chunks(batch_size.max(1)) {
        let delivery_id = format!("backfill-{}", uuid::Uuid::new_v4());
        let event = NewEvent::new("push", push_payload(repo_full_name, chunk))
            .with_delivery_id(&delivery_id);
        ids.push(
            db.append_event(&event)
                .context("Failed to append backfill event")?,
        );
    }

    info!(
        repo = %repo_full_name,
        commits = commits.len(),
        events = ids.len(),
        "Backfilled git history"
    );

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{payload, ParsedEvent};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn commit_file(repo: &GitRepo, name: &str, content: &str, message: &str, time: i64) {
        std::fs::write(repo.workdir().unwrap().join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::new("Ana", "ana@example.com", &git2::Time::new(time, 0)).unwrap();
        let parents: Vec<git2::Commit<'_>> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap();
    }

    fn sample_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let repo = GitRepo::init(dir.path()).unwrap();
        commit_file(&repo, "a.txt", "one\ntwo\n", "Initial commit", 1_700_000_000);
        commit_file(&repo, "a.txt", "one\nthree\n", "Fix #3: wrong line", 1_700_000_600);
        dir
    }

    #[test]
    fn test_reads_history_oldest_first() {
        let dir = sample_repo();
        let history = GitHistory::open(dir.path()).unwrap();
        let commits = history.commits(None).unwrap();

        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].message, "Initial commit");
        assert_eq!(commits[0].insertions, 2);
        assert_eq!(commits[1].files_changed, 1);
        assert_eq!(commits[1].insertions, 1);
        assert_eq!(commits[1].deletions, 1);
        assert_eq!(commits[1].author.as_deref(), Some("Ana"));
        assert_eq!(commits[1].files, vec!["a.txt".to_string()]);
    }

    #[test]
    fn test_backfill_events_parse_as_push() {
        let dir = sample_repo();
        let history = GitHistory::open(dir.path()).unwrap();
        let db = Database::open_in_memory().unwrap();

        let ids = backfill(&db, &history, "acme/widgets", None, 1).unwrap();
        assert_eq!(ids.len(), 2);

        let event = db.get_event(ids[1]).unwrap().unwrap();
        match payload::parse(&event, &BTreeMap::new()).unwrap() {
            ParsedEvent::Push(push) => {
                assert_eq!(push.repo_full_name, "acme/widgets");
                assert_eq!(push.commits[0].message, "Fix #3: wrong line");
                assert_eq!(push.commits[0].deletions, 1);
                assert!(push.commits[0].files.contains("a.txt"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

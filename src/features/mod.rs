//! Causal feature builder
//!
//! Computes feature vectors for a target commit or issue from the
//! repository state visible as of the target's timestamp. Rows with a later
//! timestamp never contribute, and backward-looking aggregates exclude the
//! target itself.

mod window;

pub use window::{
    default_windows, CommitField, Lookback, Metric, Scope, Subject, WindowError, WindowSpec,
    MAX_LOOKBACK_DAYS,
};

use crate::model::{Commit, FeatureRecord, FeatureVector, Issue, LinkType};
use crate::storage::{self, Database};
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Per-file churn lookback, in days
const FILE_CHURN_DAYS: i64 = 60;

/// Per-file severe-history lookback, in days
const FILE_SEVERE_DAYS: i64 = 30;

/// Features computed by the builder itself, outside the configured windows
pub const BUILTIN_FEATURES: &[&str] = &[
    "files_changed",
    "insertions",
    "deletions",
    "net_churn",
    "abs_churn",
    "msg_len",
    "msg_entropy",
    "linked_issues",
    "linked_fixes",
    "linked_max_severity",
    "repo_prior_commits",
    "author_prior_commits",
    "repo_open_issues",
    "file_age_days_max",
    "file_age_days_mean",
    "new_files",
    "file_churn_60d",
    "file_recent_severe_30d",
    "title_len",
    "body_len",
    "text_entropy",
    "label_count",
];

/// Whether `name` belongs to a built-in feature or keyword flag
pub fn is_builtin_feature(name: &str) -> bool {
    BUILTIN_FEATURES.contains(&name) || KEYWORDS.iter().any(|(flag, _)| *flag == name)
}

/// Keyword flags and the word forms that set them
const KEYWORDS: &[(&str, &[&str])] = &[
    ("kw_fix", &["fix", "fixes", "fixed"]),
    ("kw_bug", &["bug", "bugs"]),
    ("kw_refactor", &["refactor", "refactoring", "refactored"]),
    ("kw_test", &["test", "tests", "testing"]),
    ("kw_revert", &["revert", "reverted"]),
];

/// Builds feature vectors from the causal slice of a repository
#[derive(Debug, Clone)]
pub struct CausalFeatureBuilder {
    windows: Vec<WindowSpec>,
}

impl CausalFeatureBuilder {
    pub fn new(windows: Vec<WindowSpec>) -> Self {
        Self { windows }
    }

    pub fn windows(&self) -> &[WindowSpec] {
        &self.windows
    }

    /// Build the feature record of a commit
    pub fn build_commit(&self, db: &Database, commit: &Commit) -> storage::Result<FeatureRecord> {
        let feature_vector = self.commit_vector(db, commit)?;
        let vector_hash = vector_hash(&feature_vector)?;

        Ok(FeatureRecord {
            commit_sha: commit.sha.clone(),
            feature_vector,
            vector_hash,
            generated_at: Utc::now(),
        })
    }

    /// Compute the feature vector of a commit as of its timestamp
    pub fn commit_vector(&self, db: &Database, commit: &Commit) -> storage::Result<FeatureVector> {
        let at = commit.timestamp;
        let repo = commit.repo_full_name.as_str();
        let mut vector = FeatureVector::new();

        // Inclusive features of the commit itself
        let insertions = f64::from(commit.insertions);
        let deletions = f64::from(commit.deletions);
        vector.insert("files_changed".into(), f64::from(commit.files_changed));
        vector.insert("insertions".into(), insertions);
        vector.insert("deletions".into(), deletions);
        vector.insert("net_churn".into(), insertions - deletions);
        vector.insert("abs_churn".into(), insertions + deletions);
        vector.insert("msg_len".into(), commit.message.chars().count() as f64);
        vector.insert("msg_entropy".into(), text_entropy(&commit.message));
        insert_keywords(&mut vector, &commit.message);

        // Linked issues that existed when the commit was made
        let linked = db.linked_issues(&commit.sha, at)?;
        let linked_fixes = linked
            .iter()
            .filter(|l| l.link_type == LinkType::Fixes)
            .count();
        let linked_max_severity = linked
            .iter()
            .filter_map(|l| l.mapped_severity)
            .map(|s| s.rank())
            .max()
            .unwrap_or(0);
        vector.insert("linked_issues".into(), linked.len() as f64);
        vector.insert("linked_fixes".into(), linked_fixes as f64);
        vector.insert("linked_max_severity".into(), f64::from(linked_max_severity));

        // Backward-looking history, excluding the commit itself
        let repo_prior = db.count_commits_until(repo, None, at, &commit.sha)?;
        let author_prior = match commit.author.as_deref() {
            Some(author) => db.count_commits_until(repo, Some(author), at, &commit.sha)?,
            None => 0,
        };
        let issues = db.issue_points(repo, at)?;
        let open_issues = issues
            .iter()
            .filter(|i| i.closed_at.map_or(true, |closed| closed > at))
            .count();
        vector.insert("repo_prior_commits".into(), repo_prior as f64);
        vector.insert("author_prior_commits".into(), author_prior as f64);
        vector.insert("repo_open_issues".into(), open_issues as f64);

        self.insert_file_features(db, commit, &mut vector)?;

        let commits = db.commit_points(repo, self.window_start(at), at, &commit.sha)?;
        for spec in &self.windows {
            vector.insert(
                spec.feature_name(),
                spec.evaluate(&commits, &issues, commit.author.as_deref(), at),
            );
        }

        Ok(vector)
    }

    /// Compute the feature vector of an issue as of its creation.
    ///
    /// Issue vectors are not persisted; they are exposed for inspection.
    pub fn build_issue(&self, db: &Database, issue: &Issue) -> storage::Result<FeatureVector> {
        let at = issue.created_at;
        let repo = issue.repo_full_name.as_str();
        let text = format!("{}\n{}", issue.title, issue.body);
        let mut vector = FeatureVector::new();

        vector.insert("title_len".into(), issue.title.chars().count() as f64);
        vector.insert("body_len".into(), issue.body.chars().count() as f64);
        vector.insert("text_entropy".into(), text_entropy(&text));
        vector.insert("label_count".into(), issue.labels.len() as f64);
        insert_keywords(&mut vector, &text);

        let commits = db.commit_points(repo, self.window_start(at), at, "")?;
        let issues: Vec<_> = db
            .issue_points(repo, at)?
            .into_iter()
            .filter(|i| i.id != issue.id)
            .collect();

        for spec in self.windows.iter().filter(|s| s.scope == Scope::Repo) {
            vector.insert(
                spec.feature_name(),
                spec.evaluate(&commits, &issues, None, at),
            );
        }

        Ok(vector)
    }

    /// History of each path the commit touches, as of the commit.
    ///
    /// Paths with no earlier commit count as new and have age zero. Commits
    /// without a file list get zeros throughout.
    fn insert_file_features(
        &self,
        db: &Database,
        commit: &Commit,
        vector: &mut FeatureVector,
    ) -> storage::Result<()> {
        let at = commit.timestamp;
        let churn_from = days_before(at, FILE_CHURN_DAYS);
        let severe_from = days_before(at, FILE_SEVERE_DAYS);

        let mut ages = Vec::with_capacity(commit.files.len());
        let mut new_files = 0usize;
        let mut churn = 0usize;
        let mut recent_severe = 0usize;
        let mut severe_commits: HashMap<String, bool> = HashMap::new();

        for path in &commit.files {
            let touches = db.file_touches(&commit.repo_full_name, path, at, &commit.sha)?;
            match touches.first() {
                Some(first) => ages.push((at - first.timestamp).num_days() as f64),
                None => {
                    new_files += 1;
                    ages.push(0.0);
                }
            }

            for touch in &touches {
                if touch.timestamp >= churn_from {
                    churn += 1;
                }
                if touch.timestamp < severe_from {
                    continue;
                }
                let severe = match severe_commits.get(&touch.sha) {
                    Some(severe) => *severe,
                    None => {
                        let severe = db
                            .linked_issues(&touch.sha, at)?
                            .iter()
                            .any(|l| l.mapped_severity.is_some_and(|s| s.is_severe()));
                        severe_commits.insert(touch.sha.clone(), severe);
                        severe
                    }
                };
                if severe {
                    recent_severe += 1;
                }
            }
        }

        let age_max = ages.iter().copied().fold(0.0, f64::max);
        let age_mean = if ages.is_empty() {
            0.0
        } else {
            ages.iter().sum::<f64>() / ages.len() as f64
        };
        vector.insert("file_age_days_max".into(), age_max);
        vector.insert("file_age_days_mean".into(), age_mean);
        vector.insert("new_files".into(), new_files as f64);
        vector.insert("file_churn_60d".into(), churn as f64);
        vector.insert("file_recent_severe_30d".into(), recent_severe as f64);

        Ok(())
    }

    /// Start of the longest configured window ending at `at`
    fn window_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let longest = self
            .windows
            .iter()
            .map(|s| s.window.duration())
            .max()
            .unwrap_or_else(Duration::zero);
        at.checked_sub_signed(longest)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

fn days_before(at: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    at.checked_sub_signed(Duration::days(days))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Default for CausalFeatureBuilder {
    fn default() -> Self {
        Self::new(default_windows())
    }
}

/// SHA-256 of the canonical JSON form of a vector
pub fn vector_hash(vector: &FeatureVector) -> serde_json::Result<String> {
    let canonical = serde_json::to_string(vector)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Shannon entropy (bits) of the character distribution of lowercased text
pub fn text_entropy(text: &str) -> f64 {
    let lowered = text.to_lowercase();
    let mut counts: HashMap<char, usize> = HashMap::new();
    for ch in lowered.chars() {
        *counts.entry(ch).or_insert(0) += 1;
    }

    let total: usize = counts.values().sum();
    if total == 0 {
        return 0.0;
    }

    // Sorted so the floating point sum is reproducible
    let mut frequencies: Vec<usize> = counts.into_values().collect();
    frequencies.sort_unstable();

    let n = total as f64;
    -frequencies
        .into_iter()
        .map(|c| {
            let p = c as f64 / n;
            p * p.log2()
        })
        .sum::<f64>()
}

fn insert_keywords(vector: &mut FeatureVector, text: &str) {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .collect();

    for (name, forms) in KEYWORDS {
        let hit = tokens.iter().any(|t| forms.contains(t));
        vector.insert((*name).to_string(), if hit { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CommitIssueLink, IssueState, Severity};
    use chrono::{DateTime, TimeZone};
    use std::collections::BTreeSet;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, d, 9, 0, 0).unwrap()
    }

    fn commit(sha: &str, d: u32, author: &str, message: &str) -> Commit {
        Commit {
            sha: sha.to_string(),
            repo_full_name: "acme/widgets".to_string(),
            author: Some(author.to_string()),
            timestamp: day(d),
            message: message.to_string(),
            files_changed: 2,
            insertions: 10,
            deletions: 4,
            pr_number: None,
            files: BTreeSet::new(),
        }
    }

    fn issue(id: i64, number: u64, d: u32, severity: Option<Severity>) -> Issue {
        Issue {
            id,
            repo_full_name: "acme/widgets".to_string(),
            number,
            title: "Crash on start".to_string(),
            body: "Steps to reproduce".to_string(),
            labels: BTreeSet::from(["bug".to_string()]),
            mapped_severity: severity,
            state: IssueState::Open,
            created_at: day(d),
            closed_at: None,
        }
    }

    #[test]
    fn test_static_features() {
        let db = Database::open_in_memory().unwrap();
        let builder = CausalFeatureBuilder::default();
        let target = commit("c1", 10, "ana", "Fixed the parser bug");
        db.upsert_commit(&target).unwrap();

        let v = builder.commit_vector(&db, &target).unwrap();
        assert_eq!(v["net_churn"], 6.0);
        assert_eq!(v["abs_churn"], 14.0);
        assert_eq!(v["msg_len"], 20.0);
        assert_eq!(v["kw_fix"], 1.0);
        assert_eq!(v["kw_bug"], 1.0);
        assert_eq!(v["kw_test"], 0.0);
        assert_eq!(v["linked_issues"], 0.0);
        assert_eq!(v["repo_prior_commits"], 0.0);
    }

    #[test]
    fn test_keywords_match_whole_words() {
        let mut v = FeatureVector::new();
        insert_keywords(&mut v, "prefix debugging contest");
        assert_eq!(v["kw_fix"], 0.0);
        assert_eq!(v["kw_bug"], 0.0);
        assert_eq!(v["kw_test"], 0.0);

        insert_keywords(&mut v, "Revert: tests for refactoring");
        assert_eq!(v["kw_revert"], 1.0);
        assert_eq!(v["kw_test"], 1.0);
        assert_eq!(v["kw_refactor"], 1.0);
    }

    #[test]
    fn test_entropy() {
        assert_eq!(text_entropy(""), 0.0);
        assert_eq!(text_entropy("aaaa"), 0.0);
        assert!((text_entropy("Ab") - 1.0).abs() < 1e-12);
        assert!((text_entropy("abcd") - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_future_rows_do_not_change_vector() {
        let db = Database::open_in_memory().unwrap();
        let builder = CausalFeatureBuilder::default();

        db.upsert_commit(&commit("old", 2, "ana", "init")).unwrap();
        let target = commit("target", 5, "ana", "fixes #1");
        db.upsert_commit(&target).unwrap();
        db.upsert_issue(&issue(100, 1, 3, Some(Severity::High)), day(3)).unwrap();
        db.replace_commit_links(
            "target",
            &[CommitIssueLink {
                commit_sha: "target".to_string(),
                repo_full_name: "acme/widgets".to_string(),
                issue_number: 1,
                issue_id: Some(100),
                link_type: LinkType::Fixes,
            }],
        )
        .unwrap();

        let before = builder.build_commit(&db, &target).unwrap();
        assert_eq!(before.feature_vector["linked_fixes"], 1.0);
        assert_eq!(before.feature_vector["linked_max_severity"], 3.0);
        assert_eq!(before.feature_vector["repo_prior_commits"], 1.0);
        assert_eq!(before.feature_vector["repo_open_issues"], 1.0);

        // Everything below happens after the target
        db.upsert_commit(&commit("later", 7, "ana", "more")).unwrap();
        db.upsert_issue(&issue(200, 2, 8, Some(Severity::Critical)), day(8)).unwrap();
        let mut closed = issue(100, 1, 3, Some(Severity::High));
        closed.state = IssueState::Closed;
        closed.closed_at = Some(day(9));
        db.upsert_issue(&closed, day(9)).unwrap();

        let after = builder.build_commit(&db, &target).unwrap();
        assert_eq!(before.feature_vector, after.feature_vector);
        assert_eq!(before.vector_hash, after.vector_hash);
    }

    #[test]
    fn test_issue_created_after_commit_is_not_linked_feature() {
        let db = Database::open_in_memory().unwrap();
        let builder = CausalFeatureBuilder::default();
        let target = commit("target", 5, "ana", "fixes #1");
        db.upsert_commit(&target).unwrap();
        db.upsert_issue(&issue(100, 1, 6, Some(Severity::Critical)), day(6)).unwrap();
        db.replace_commit_links(
            "target",
            &[CommitIssueLink {
                commit_sha: "target".to_string(),
                repo_full_name: "acme/widgets".to_string(),
                issue_number: 1,
                issue_id: Some(100),
                link_type: LinkType::Fixes,
            }],
        )
        .unwrap();

        let v = builder.commit_vector(&db, &target).unwrap();
        assert_eq!(v["linked_issues"], 0.0);
        assert_eq!(v["linked_max_severity"], 0.0);
    }

    #[test]
    fn test_deterministic_hash() {
        let db = Database::open_in_memory().unwrap();
        let builder = CausalFeatureBuilder::default();
        let target = commit("c1", 10, "ana", "Refactor the parser");
        db.upsert_commit(&target).unwrap();

        let first = builder.build_commit(&db, &target).unwrap();
        let second = builder.build_commit(&db, &target).unwrap();
        assert_eq!(first.vector_hash, second.vector_hash);
        assert_eq!(first.vector_hash.len(), 64);
    }

    #[test]
    fn test_issue_vector() {
        let db = Database::open_in_memory().unwrap();
        let builder = CausalFeatureBuilder::default();
        db.upsert_commit(&commit("c1", 2, "ana", "init")).unwrap();
        let target = issue(100, 1, 3, None);
        db.upsert_issue(&target, target.created_at).unwrap();

        let v = builder.build_issue(&db, &target).unwrap();
        assert_eq!(v["label_count"], 1.0);
        assert_eq!(v["title_len"], 14.0);
        assert_eq!(v["repo_commits_count_7d"], 1.0);
        assert!(!v.contains_key("author_commits_count_30d"));
    }

    #[test]
    fn test_file_history_features() {
        let db = Database::open_in_memory().unwrap();
        let builder = CausalFeatureBuilder::default();
        let touching = |sha: &str, d: u32, paths: &[&str]| {
            let mut c = commit(sha, d, "ana", "change");
            c.files = paths.iter().map(|p| p.to_string()).collect();
            c
        };

        db.upsert_commit(&touching("first", 1, &["src/a.rs"])).unwrap();
        db.upsert_commit(&touching("second", 5, &["src/a.rs", "src/b.rs"]))
            .unwrap();
        let target = touching("target", 10, &["src/a.rs", "src/c.rs"]);
        db.upsert_commit(&target).unwrap();
        db.upsert_commit(&touching("later", 12, &["src/a.rs", "src/c.rs"]))
            .unwrap();

        db.upsert_issue(&issue(100, 1, 1, Some(Severity::Critical)), day(1))
            .unwrap();
        db.replace_commit_links(
            "first",
            &[CommitIssueLink {
                commit_sha: "first".to_string(),
                repo_full_name: "acme/widgets".to_string(),
                issue_number: 1,
                issue_id: Some(100),
                link_type: LinkType::Fixes,
            }],
        )
        .unwrap();

        let v = builder.commit_vector(&db, &target).unwrap();
        assert_eq!(v["file_age_days_max"], 9.0);
        assert_eq!(v["file_age_days_mean"], 4.5);
        assert_eq!(v["new_files"], 1.0);
        assert_eq!(v["file_churn_60d"], 2.0);
        assert_eq!(v["file_recent_severe_30d"], 1.0);

        // No file list, no file history
        let bare = commit("bare", 11, "ana", "change");
        db.upsert_commit(&bare).unwrap();
        let v = builder.commit_vector(&db, &bare).unwrap();
        assert_eq!(v["file_age_days_max"], 0.0);
        assert_eq!(v["new_files"], 0.0);
        assert_eq!(v["file_churn_60d"], 0.0);
    }

    #[test]
    fn test_every_feature_outside_windows_is_builtin() {
        let db = Database::open_in_memory().unwrap();
        let builder = CausalFeatureBuilder::default();
        let target = commit("c1", 10, "ana", "init");
        db.upsert_commit(&target).unwrap();
        let window_names: Vec<String> =
            builder.windows().iter().map(|w| w.feature_name()).collect();

        let v = builder.commit_vector(&db, &target).unwrap();
        for name in v.keys() {
            assert!(
                is_builtin_feature(name) || window_names.contains(name),
                "{}",
                name
            );
        }
        for name in &window_names {
            assert!(!is_builtin_feature(name), "{}", name);
        }
        assert!(is_builtin_feature("kw_fix"));
    }

    #[test]
    fn test_unbounded_window_does_not_overflow() {
        let db = Database::open_in_memory().unwrap();
        let builder = CausalFeatureBuilder::new(vec![WindowSpec::new(
            Lookback::days(u32::MAX),
            Metric::Count,
            Scope::Repo,
            Subject::Commits,
        )]);
        db.upsert_commit(&commit("old", 1, "ana", "init")).unwrap();
        let target = commit("target", 10, "ana", "change");
        db.upsert_commit(&target).unwrap();

        let v = builder.commit_vector(&db, &target).unwrap();
        assert_eq!(v[&builder.windows()[0].feature_name()], 1.0);
    }
}

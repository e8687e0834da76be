//! Commit/issue link resolution
//!
//! Issue references are extracted from commit messages with a small
//! hand-written scanner:
//! - `#N` and `GH-N` are references
//! - a preceding `fix/fixes/fixed/resolve/resolves/resolved` verb makes it `fixes`
//! - a preceding `close/closes/closed` verb makes it `closes`
//!
//! When one message references the same issue several times, the strongest
//! relation wins (`fixes` > `closes` > `references`).

use crate::model::{Commit, CommitIssueLink, Issue, LinkType};
use crate::storage::{self, Database};
use std::collections::BTreeMap;
use tracing::debug;

/// An issue reference found in free text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueReference {
    pub number: u64,
    pub link_type: LinkType,
}

/// Extract issue references from text.
///
/// Returns at most one reference per issue number, ordered by number.
pub fn parse_references(text: &str) -> Vec<IssueReference> {
    let chars: Vec<char> = text.chars().collect();
    let mut strongest: BTreeMap<u64, LinkType> = BTreeMap::new();
    let mut i = 0;

    while i < chars.len() {
        let digits_start = if chars[i] == '#' {
            i + 1
        } else if is_gh_prefix(&chars, i) {
            i + 3
        } else {
            i += 1;
            continue;
        };

        // `abc#1` and `owner/repo#1` are not references to this repository
        if i > 0 && (is_word_char(chars[i - 1]) || chars[i - 1] == '/') {
            i = digits_start;
            continue;
        }

        let mut end = digits_start;
        while end < chars.len() && chars[end].is_ascii_digit() {
            end += 1;
        }

        if end == digits_start || (end < chars.len() && is_word_char(chars[end])) {
            i = digits_start;
            continue;
        }

        let digits: String = chars[digits_start..end].iter().collect();
        if let Ok(number) = digits.parse::<u64>() {
            if number > 0 {
                let link_type = verb_before(&chars, i).unwrap_or(LinkType::References);
                let entry = strongest.entry(number).or_insert(link_type);
                if link_type > *entry {
                    *entry = link_type;
                }
            }
        }

        i = end;
    }

    strongest
        .into_iter()
        .map(|(number, link_type)| IssueReference { number, link_type })
        .collect()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_gh_prefix(chars: &[char], i: usize) -> bool {
    i + 2 < chars.len()
        && chars[i].eq_ignore_ascii_case(&'g')
        && chars[i + 1].eq_ignore_ascii_case(&'h')
        && chars[i + 2] == '-'
}

/// Classify the word directly before a reference starting at `start`.
///
/// Whitespace and a single `:` may separate verb and reference.
fn verb_before(chars: &[char], start: usize) -> Option<LinkType> {
    let mut j = start;
    while j > 0 && chars[j - 1].is_whitespace() {
        j -= 1;
    }
    if j > 0 && chars[j - 1] == ':' {
        j -= 1;
        while j > 0 && chars[j - 1].is_whitespace() {
            j -= 1;
        }
    }

    let word_end = j;
    while j > 0 && chars[j - 1].is_alphabetic() {
        j -= 1;
    }
    if j == word_end || (j > 0 && is_word_char(chars[j - 1])) {
        return None;
    }

    let word: String = chars[j..word_end].iter().collect::<String>().to_lowercase();
    verb_family(&word)
}

fn verb_family(word: &str) -> Option<LinkType> {
    match word {
        "fix" | "fixes" | "fixed" | "resolve" | "resolves" | "resolved" => Some(LinkType::Fixes),
        "close" | "closes" | "closed" => Some(LinkType::Closes),
        _ => None,
    }
}

/// Resolves references into persisted commit/issue links
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkResolver;

impl LinkResolver {
    pub fn new() -> Self {
        Self
    }

    /// Parse a commit message and replace the commit's links.
    ///
    /// References to issues that have not arrived yet are stored as pending
    /// links (no `issue_id`).
    pub fn resolve_commit(
        &self,
        db: &Database,
        commit: &Commit,
    ) -> storage::Result<Vec<CommitIssueLink>> {
        let references = parse_references(&commit.message);
        let mut links = Vec::with_capacity(references.len());

        for reference in references {
            let issue_id = db
                .find_issue(&commit.repo_full_name, reference.number)?
                .map(|issue| issue.id);

            links.push(CommitIssueLink {
                commit_sha: commit.sha.clone(),
                repo_full_name: commit.repo_full_name.clone(),
                issue_number: reference.number,
                issue_id,
                link_type: reference.link_type,
            });
        }

        db.replace_commit_links(&commit.sha, &links)?;

        debug!(
            sha = %commit.sha,
            links = links.len(),
            pending = links.iter().filter(|l| l.is_pending()).count(),
            "Resolved commit links"
        );

        Ok(links)
    }

    /// Attach a newly arrived issue to the links waiting on it
    pub fn resolve_issue(&self, db: &Database, issue: &Issue) -> storage::Result<usize> {
        let resolved = db.resolve_pending_links(&issue.repo_full_name, issue.number, issue.id)?;

        if resolved > 0 {
            debug!(
                repo = %issue.repo_full_name,
                number = issue.number,
                resolved,
                "Resolved pending links"
            );
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IssueState;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    fn refs(text: &str) -> Vec<(u64, LinkType)> {
        parse_references(text)
            .into_iter()
            .map(|r| (r.number, r.link_type))
            .collect()
    }

    #[test]
    fn test_verb_families() {
        assert_eq!(refs("Fixes #12"), vec![(12, LinkType::Fixes)]);
        assert_eq!(refs("resolved #3"), vec![(3, LinkType::Fixes)]);
        assert_eq!(refs("closes: #7"), vec![(7, LinkType::Closes)]);
        assert_eq!(refs("see #9"), vec![(9, LinkType::References)]);
        assert_eq!(refs("fix GH-21"), vec![(21, LinkType::Fixes)]);
    }

    #[test]
    fn test_strongest_relation_wins() {
        assert_eq!(refs("fixes #5, references #5"), vec![(5, LinkType::Fixes)]);
        assert_eq!(refs("#5 then closes #5"), vec![(5, LinkType::Closes)]);
        assert_eq!(refs("closes #5 and fixes #5"), vec![(5, LinkType::Fixes)]);
    }

    #[test]
    fn test_not_references() {
        assert!(refs("issue#5").is_empty());
        assert!(refs("other/repo#5").is_empty());
        assert!(refs("#abc").is_empty());
        assert!(refs("#5x").is_empty());
        assert!(refs("#0").is_empty());
        assert!(refs("prefix #5")[0].1 == LinkType::References);
        assert!(refs("unfixed #5")[0].1 == LinkType::References);
    }

    #[test]
    fn test_multiple_issues() {
        assert_eq!(
            refs("Fixes #10, closes #2 (see #33)"),
            vec![
                (2, LinkType::Closes),
                (10, LinkType::Fixes),
                (33, LinkType::References)
            ]
        );
    }

    fn commit(message: &str) -> Commit {
        Commit {
            sha: "abc".to_string(),
            repo_full_name: "acme/widgets".to_string(),
            author: None,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(),
            message: message.to_string(),
            files_changed: 1,
            insertions: 1,
            deletions: 0,
            pr_number: None,
            files: BTreeSet::new(),
        }
    }

    #[test]
    fn test_resolver_records_pending_and_resolves_later() {
        let db = Database::open_in_memory().unwrap();
        let resolver = LinkResolver::new();
        let commit = commit("fixes #42");
        db.upsert_commit(&commit).unwrap();

        let links = resolver.resolve_commit(&db, &commit).unwrap();
        assert_eq!(links.len(), 1);
        assert!(links[0].is_pending());

        let issue = Issue {
            id: 4200,
            repo_full_name: "acme/widgets".to_string(),
            number: 42,
            title: "Crash".to_string(),
            body: String::new(),
            labels: BTreeSet::new(),
            mapped_severity: None,
            state: IssueState::Open,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            closed_at: None,
        };
        db.upsert_issue(&issue, issue.created_at).unwrap();
        assert_eq!(resolver.resolve_issue(&db, &issue).unwrap(), 1);

        let stored = db.links_for_commit("abc").unwrap();
        assert_eq!(stored[0].issue_id, Some(4200));
        assert_eq!(stored[0].link_type, LinkType::Fixes);
    }

    #[test]
    fn test_reprocessing_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let resolver = LinkResolver::new();
        let commit = commit("fixes #5, references #5, see #6");
        db.upsert_commit(&commit).unwrap();

        let first = resolver.resolve_commit(&db, &commit).unwrap();
        let second = resolver.resolve_commit(&db, &commit).unwrap();
        assert_eq!(first, second);
        assert_eq!(db.links_for_commit("abc").unwrap(), first);
    }
}

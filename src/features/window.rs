//! Configurable lookback windows

use crate::storage::{CommitPoint, IssuePoint};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Longest accepted lookback
pub const MAX_LOOKBACK_DAYS: u32 = 3650;

/// Errors in a window definition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("invalid lookback {0:?}: expected <n>d, <n>h or <n>m with n > 0")]
    InvalidLookback(String),

    #[error("lookback {0} exceeds {MAX_LOOKBACK_DAYS} days")]
    LookbackTooLong(String),

    #[error("window {name}: {detail}")]
    Invalid { name: String, detail: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookbackUnit {
    Days,
    Hours,
    Minutes,
}

/// Length of a lookback window, written as `30d`, `12h` or `45m`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Lookback {
    amount: u32,
    unit: LookbackUnit,
}

impl Lookback {
    pub fn days(amount: u32) -> Self {
        Self {
            amount,
            unit: LookbackUnit::Days,
        }
    }

    pub fn parse(value: &str) -> Result<Self, WindowError> {
        let value = value.trim();
        let invalid = || WindowError::InvalidLookback(value.to_string());

        let split = value.len().checked_sub(1).ok_or_else(invalid)?;
        if !value.is_char_boundary(split) {
            return Err(invalid());
        }
        let (digits, unit) = value.split_at(split);

        let unit = match unit {
            "d" | "D" => LookbackUnit::Days,
            "h" | "H" => LookbackUnit::Hours,
            "m" | "M" => LookbackUnit::Minutes,
            _ => return Err(invalid()),
        };
        let amount: u32 = digits.parse().map_err(|_| invalid())?;
        if amount == 0 {
            return Err(invalid());
        }

        let lookback = Self { amount, unit };
        lookback.check_bounds()?;
        Ok(lookback)
    }

    fn check_bounds(&self) -> Result<(), WindowError> {
        if self.duration() > Duration::days(i64::from(MAX_LOOKBACK_DAYS)) {
            return Err(WindowError::LookbackTooLong(self.to_string()));
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        let amount = i64::from(self.amount);
        match self.unit {
            LookbackUnit::Days => Duration::days(amount),
            LookbackUnit::Hours => Duration::hours(amount),
            LookbackUnit::Minutes => Duration::minutes(amount),
        }
    }

    /// Window length in (fractional) days, the denominator of `rate`
    pub fn as_days(&self) -> f64 {
        self.duration().num_seconds() as f64 / 86_400.0
    }
}

impl fmt::Display for Lookback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            LookbackUnit::Days => 'd',
            LookbackUnit::Hours => 'h',
            LookbackUnit::Minutes => 'm',
        };
        write!(f, "{}{}", self.amount, unit)
    }
}

impl TryFrom<String> for Lookback {
    type Error = WindowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Lookback::parse(&value)
    }
}

impl From<Lookback> for String {
    fn from(value: Lookback) -> Self {
        value.to_string()
    }
}

/// Aggregation applied to the rows inside a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Count,
    Mean,
    /// Count per day
    Rate,
}

/// Whose activity a window looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Repo,
    Author,
}

/// Which rows a window aggregates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    Commits,
    Issues,
    /// Issues mapped to high or critical severity
    SevereIssues,
}

/// Commit column averaged by `mean`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitField {
    AbsChurn,
    FilesChanged,
    Insertions,
    Deletions,
}

impl CommitField {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitField::AbsChurn => "abs_churn",
            CommitField::FilesChanged => "files_changed",
            CommitField::Insertions => "insertions",
            CommitField::Deletions => "deletions",
        }
    }

    fn value(self, commit: &CommitPoint) -> f64 {
        match self {
            CommitField::AbsChurn => f64::from(commit.insertions) + f64::from(commit.deletions),
            CommitField::FilesChanged => f64::from(commit.files_changed),
            CommitField::Insertions => f64::from(commit.insertions),
            CommitField::Deletions => f64::from(commit.deletions),
        }
    }
}

/// One windowed aggregate feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSpec {
    /// Feature name; derived from the other fields when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub window: Lookback,

    pub metric: Metric,

    pub scope: Scope,

    pub subject: Subject,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<CommitField>,
}

impl WindowSpec {
    pub fn new(window: Lookback, metric: Metric, scope: Scope, subject: Subject) -> Self {
        Self {
            name: None,
            window,
            metric,
            scope,
            subject,
            field: None,
        }
    }

    pub fn with_field(mut self, field: CommitField) -> Self {
        self.field = Some(field);
        self
    }

    /// Name of the feature this window produces
    pub fn feature_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }

        let scope = match self.scope {
            Scope::Repo => "repo",
            Scope::Author => "author",
        };
        let subject = match self.subject {
            Subject::Commits => "commits",
            Subject::Issues => "issues",
            Subject::SevereIssues => "severe_issues",
        };
        let metric = match self.metric {
            Metric::Count => "count",
            Metric::Mean => "mean",
            Metric::Rate => "rate",
        };

        match self.field {
            Some(field) => format!(
                "{}_{}_{}_{}_{}",
                scope,
                subject,
                metric,
                field.as_str(),
                self.window
            ),
            None => format!("{}_{}_{}_{}", scope, subject, metric, self.window),
        }
    }

    pub fn validate(&self) -> Result<(), WindowError> {
        self.window.check_bounds()?;

        let invalid = |detail| {
            Err(WindowError::Invalid {
                name: self.feature_name(),
                detail,
            })
        };

        if self.metric == Metric::Mean {
            if self.field.is_none() {
                return invalid("metric `mean` requires a `field`");
            }
            if self.subject != Subject::Commits {
                return invalid("metric `mean` is only defined for commits");
            }
        }
        if self.field.is_some() && self.metric != Metric::Mean {
            return invalid("`field` is only used by metric `mean`");
        }
        if self.subject != Subject::Commits && self.scope != Scope::Repo {
            return invalid("issue windows require scope `repo`");
        }

        Ok(())
    }

    /// Evaluate the window as of `at` over a causal slice.
    ///
    /// `commits` and `issues` may extend further back than this window; rows
    /// outside `[at - window, at]` are ignored. `author` is the target's
    /// author for author-scoped windows.
    pub fn evaluate(
        &self,
        commits: &[CommitPoint],
        issues: &[IssuePoint],
        author: Option<&str>,
        at: DateTime<Utc>,
    ) -> f64 {
        let from = at
            .checked_sub_signed(self.window.duration())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let in_window = |t: DateTime<Utc>| t >= from && t <= at;

        match self.subject {
            Subject::Commits => {
                let selected: Vec<&CommitPoint> = commits
                    .iter()
                    .filter(|c| in_window(c.timestamp))
                    .filter(|c| match self.scope {
                        Scope::Repo => true,
                        Scope::Author => author.is_some() && c.author.as_deref() == author,
                    })
                    .collect();

                match self.metric {
                    Metric::Count => selected.len() as f64,
                    Metric::Rate => selected.len() as f64 / self.window.as_days(),
                    Metric::Mean => match (self.field, selected.len()) {
                        (Some(field), n) if n > 0 => {
                            selected.iter().map(|c| field.value(c)).sum::<f64>() / n as f64
                        }
                        _ => 0.0,
                    },
                }
            }
            Subject::Issues | Subject::SevereIssues => {
                let count = issues
                    .iter()
                    .filter(|i| in_window(i.created_at))
                    .filter(|i| {
                        self.subject == Subject::Issues
                            || i.mapped_severity.is_some_and(|s| s.is_severe())
                    })
                    .count() as f64;

                match self.metric {
                    Metric::Rate => count / self.window.as_days(),
                    _ => count,
                }
            }
        }
    }
}

/// Windows used when the configuration does not list any
pub fn default_windows() -> Vec<WindowSpec> {
    vec![
        WindowSpec::new(Lookback::days(7), Metric::Count, Scope::Repo, Subject::Commits),
        WindowSpec::new(Lookback::days(30), Metric::Count, Scope::Repo, Subject::Commits),
        WindowSpec::new(Lookback::days(30), Metric::Count, Scope::Author, Subject::Commits),
        WindowSpec::new(Lookback::days(30), Metric::Mean, Scope::Repo, Subject::Commits)
            .with_field(CommitField::AbsChurn),
        WindowSpec::new(Lookback::days(30), Metric::Count, Scope::Repo, Subject::SevereIssues),
        WindowSpec::new(Lookback::days(60), Metric::Rate, Scope::Repo, Subject::Commits),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap()
    }

    fn commit(day: u32, author: &str, churn: u32) -> CommitPoint {
        CommitPoint {
            sha: format!("{}-{}", author, day),
            timestamp: at(day),
            author: Some(author.to_string()),
            files_changed: 1,
            insertions: churn,
            deletions: 0,
        }
    }

    #[test]
    fn test_lookback_parsing() {
        assert_eq!(Lookback::parse("30d").unwrap(), Lookback::days(30));
        assert_eq!(Lookback::parse("12h").unwrap().duration(), Duration::hours(12));
        assert_eq!(Lookback::parse("45m").unwrap().to_string(), "45m");
        assert!(Lookback::parse("0d").is_err());
        assert!(Lookback::parse("d").is_err());
        assert!(Lookback::parse("").is_err());
        assert!(Lookback::parse("3w").is_err());
        assert_eq!(
            Lookback::parse("100000000d"),
            Err(WindowError::LookbackTooLong("100000000d".to_string()))
        );
        assert!(Lookback::parse("3650d").is_ok());
        assert!(Lookback::parse("87601h").is_err());
    }

    #[test]
    fn test_oversized_window_is_rejected_and_never_overflows() {
        let huge = WindowSpec::new(
            Lookback::days(u32::MAX),
            Metric::Count,
            Scope::Repo,
            Subject::Commits,
        );
        assert!(huge.validate().is_err());
        assert_eq!(huge.evaluate(&[commit(1, "ana", 5)], &[], None, at(10)), 1.0);
    }

    #[test]
    fn test_window_spec_from_toml() {
        let spec: WindowSpec = toml::from_str(
            r#"
            window = "14d"
            metric = "mean"
            scope = "repo"
            subject = "commits"
            field = "insertions"
            "#,
        )
        .unwrap();

        assert_eq!(spec.window, Lookback::days(14));
        assert_eq!(spec.feature_name(), "repo_commits_mean_insertions_14d");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mean_without_field =
            WindowSpec::new(Lookback::days(7), Metric::Mean, Scope::Repo, Subject::Commits);
        assert!(mean_without_field.validate().is_err());

        let author_issues =
            WindowSpec::new(Lookback::days(7), Metric::Count, Scope::Author, Subject::Issues);
        assert!(author_issues.validate().is_err());

        for spec in default_windows() {
            assert!(spec.validate().is_ok(), "{}", spec.feature_name());
        }
    }

    #[test]
    fn test_evaluate_commit_windows() {
        let commits = vec![
            commit(1, "ana", 100),
            commit(8, "bo", 10),
            commit(9, "ana", 30),
        ];

        let count =
            WindowSpec::new(Lookback::days(7), Metric::Count, Scope::Repo, Subject::Commits);
        assert_eq!(count.evaluate(&commits, &[], None, at(10)), 2.0);

        let author =
            WindowSpec::new(Lookback::days(30), Metric::Count, Scope::Author, Subject::Commits);
        assert_eq!(author.evaluate(&commits, &[], Some("ana"), at(10)), 2.0);
        assert_eq!(author.evaluate(&commits, &[], None, at(10)), 0.0);

        let mean = WindowSpec::new(Lookback::days(7), Metric::Mean, Scope::Repo, Subject::Commits)
            .with_field(CommitField::AbsChurn);
        assert_eq!(mean.evaluate(&commits, &[], None, at(10)), 20.0);

        let rate = WindowSpec::new(Lookback::days(10), Metric::Rate, Scope::Repo, Subject::Commits);
        assert!((rate.evaluate(&commits, &[], None, at(10)) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_empty_history_is_zero() {
        for spec in default_windows() {
            assert_eq!(spec.evaluate(&[], &[], Some("ana"), at(10)), 0.0);
        }
    }

    #[test]
    fn test_evaluate_severe_issues() {
        let issues = vec![
            IssuePoint {
                id: 1,
                created_at: at(5),
                closed_at: None,
                mapped_severity: Some(Severity::Critical),
            },
            IssuePoint {
                id: 2,
                created_at: at(6),
                closed_at: None,
                mapped_severity: Some(Severity::Low),
            },
        ];

        let severe = WindowSpec::new(
            Lookback::days(30),
            Metric::Count,
            Scope::Repo,
            Subject::SevereIssues,
        );
        let all = WindowSpec::new(Lookback::days(30), Metric::Count, Scope::Repo, Subject::Issues);

        assert_eq!(severe.evaluate(&[], &issues, None, at(10)), 1.0);
        assert_eq!(all.evaluate(&[], &issues, None, at(10)), 2.0);
    }
}

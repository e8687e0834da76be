//! Feature records and predictions

use super::{parse_ts, ts, Database, Result, StorageError};
use crate::inference::Classification;
use crate::model::{FeatureRecord, Prediction};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const PREDICTION_COLUMNS: &str = "p.commit_sha, p.predicted_class, p.severity_score, \
     p.probability_distribution, p.model_version, p.feature_hash, p.revision, p.created_at";

impl Database {
    // ==================== Features ====================

    /// Insert or replace the feature record of a commit
    pub fn upsert_features(&self, record: &FeatureRecord) -> Result<()> {
        let vector_json = serde_json::to_string(&record.feature_vector)?;

        self.conn()?.execute(
            r#"
            INSERT INTO features (commit_sha, feature_vector, vector_hash, generated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(commit_sha) DO UPDATE SET
                feature_vector = excluded.feature_vector,
                vector_hash = excluded.vector_hash,
                generated_at = excluded.generated_at
            "#,
            params![
                record.commit_sha,
                vector_json,
                record.vector_hash,
                ts(&record.generated_at),
            ],
        )?;

        Ok(())
    }

    /// Get the feature record of a commit
    pub fn get_features(&self, commit_sha: &str) -> Result<Option<FeatureRecord>> {
        let row = self
            .conn()?
            .query_row(
                r#"
                SELECT commit_sha, feature_vector, vector_hash, generated_at
                FROM features WHERE commit_sha = ?1
                "#,
                params![commit_sha],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(commit_sha, vector, vector_hash, generated_at)| -> Result<FeatureRecord> {
            Ok(FeatureRecord {
                commit_sha,
                feature_vector: serde_json::from_str(&vector)?,
                vector_hash,
                generated_at: parse_ts("features", &generated_at)?,
            })
        })
        .transpose()
    }

    // ==================== Predictions ====================

    /// Insert or replace the prediction of a commit.
    ///
    /// Returns the stored row. `created_at` is strictly increasing across
    /// writes and `revision` counts how often the row was written.
    pub fn upsert_prediction(
        &self,
        commit_sha: &str,
        model_version: &str,
        feature_hash: &str,
        classification: &Classification,
    ) -> Result<Prediction> {
        let distribution = serde_json::to_string(&classification.probability_distribution)?;
        // Clock is read under the connection lock so created_at follows commit order
        let conn = self.conn()?;
        let created_at = self.monotonic_now()?;

        conn.execute(
            r#"
            INSERT INTO predictions (
                commit_sha, predicted_class, severity_score, probability_distribution,
                model_version, feature_hash, revision, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)
            ON CONFLICT(commit_sha) DO UPDATE SET
                predicted_class = excluded.predicted_class,
                severity_score = excluded.severity_score,
                probability_distribution = excluded.probability_distribution,
                model_version = excluded.model_version,
                feature_hash = excluded.feature_hash,
                revision = predictions.revision + 1,
                created_at = excluded.created_at
            "#,
            params![
                commit_sha,
                classification.predicted_class,
                classification.severity_score,
                distribution,
                model_version,
                feature_hash,
                ts(&created_at),
            ],
        )?;

        let stored = query_prediction(&conn, commit_sha)?;
        stored.ok_or_else(|| StorageError::corrupt("predictions", "row vanished after upsert"))
    }

    /// Get the latest prediction of a commit
    pub fn get_prediction(&self, commit_sha: &str) -> Result<Option<Prediction>> {
        let conn = self.conn()?;
        query_prediction(&conn, commit_sha)
    }

    /// List predictions for a repository, optionally bounded by commit
    /// timestamp, oldest commit first
    pub fn list_predictions(
        &self,
        repo_full_name: &str,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Prediction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM predictions p JOIN commits c ON c.sha = p.commit_sha
            WHERE c.repo_full_name = ?1
              AND (?2 IS NULL OR c.timestamp >= ?2)
              AND (?3 IS NULL OR c.timestamp <= ?3)
            ORDER BY c.timestamp, c.sha
            LIMIT ?4
            "#,
            PREDICTION_COLUMNS
        ))?;

        let rows = stmt.query_map(
            params![
                repo_full_name,
                since.as_ref().map(ts),
                until.as_ref().map(ts),
                limit as i64
            ],
            PredictionRow::from_row,
        )?;

        let mut predictions = Vec::new();
        for row in rows {
            predictions.push(row?.into_prediction()?);
        }

        Ok(predictions)
    }
}

fn query_prediction(conn: &Connection, commit_sha: &str) -> Result<Option<Prediction>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM predictions p WHERE p.commit_sha = ?1",
                PREDICTION_COLUMNS
            ),
            params![commit_sha],
            PredictionRow::from_row,
        )
        .optional()?;

    row.map(PredictionRow::into_prediction).transpose()
}

// Internal row types for database mapping

struct PredictionRow {
    commit_sha: String,
    predicted_class: String,
    severity_score: f64,
    probability_distribution: String,
    model_version: String,
    feature_hash: String,
    revision: i64,
    created_at: String,
}

impl PredictionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            commit_sha: row.get(0)?,
            predicted_class: row.get(1)?,
            severity_score: row.get(2)?,
            probability_distribution: row.get(3)?,
            model_version: row.get(4)?,
            feature_hash: row.get(5)?,
            revision: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_prediction(self) -> Result<Prediction> {
        Ok(Prediction {
            commit_sha: self.commit_sha,
            predicted_class: self.predicted_class,
            severity_score: self.severity_score,
            probability_distribution: serde_json::from_str(&self.probability_distribution)?,
            model_version: self.model_version,
            feature_hash: self.feature_hash,
            revision: self.revision,
            created_at: parse_ts("predictions", &self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Commit, FeatureVector};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn classification(high: f64) -> Classification {
        let mut distribution = BTreeMap::new();
        distribution.insert("high".to_string(), high);
        distribution.insert("low".to_string(), 1.0 - high);
        Classification {
            predicted_class: if high > 0.5 { "high" } else { "low" }.to_string(),
            severity_score: high,
            probability_distribution: distribution,
        }
    }

    #[test]
    fn test_features_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let mut vector = FeatureVector::new();
        vector.insert("msg_len".to_string(), 12.0);
        vector.insert("msg_entropy".to_string(), 2.718281828459045);

        let record = FeatureRecord {
            commit_sha: "abc".to_string(),
            feature_vector: vector,
            vector_hash: "hash".to_string(),
            generated_at: Utc::now(),
        };
        db.upsert_features(&record).unwrap();

        let stored = db.get_features("abc").unwrap().unwrap();
        assert_eq!(stored.feature_vector, record.feature_vector);
        assert_eq!(stored.vector_hash, "hash");
    }

    #[test]
    fn test_prediction_upsert_keeps_single_row() {
        let db = Database::open_in_memory().unwrap();

        let first = db
            .upsert_prediction("abc", "v1", "h1", &classification(0.2))
            .unwrap();
        let second = db
            .upsert_prediction("abc", "v1", "h2", &classification(0.9))
            .unwrap();

        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 2);
        assert!(second.created_at > first.created_at);
        assert_eq!(second.predicted_class, "high");
        assert_eq!(db.get_stats().unwrap().predictions, 1);
    }

    #[test]
    fn test_list_predictions_by_repo_and_range() {
        let db = Database::open_in_memory().unwrap();
        for (sha, day) in [("a", 1), ("b", 5), ("c", 9)] {
            db.upsert_commit(&Commit {
                sha: sha.to_string(),
                repo_full_name: "acme/widgets".to_string(),
                author: None,
                timestamp: Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap(),
                message: String::new(),
                files_changed: 0,
                insertions: 0,
                deletions: 0,
                pr_number: None,
                files: Default::default(),
            })
            .unwrap();
            db.upsert_prediction(sha, "v1", "h", &classification(0.5))
                .unwrap();
        }

        let all = db.list_predictions("acme/widgets", None, None, 100).unwrap();
        assert_eq!(all.len(), 3);

        let ranged = db
            .list_predictions(
                "acme/widgets",
                Some(Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap()),
                Some(Utc.with_ymd_and_hms(2025, 1, 9, 0, 0, 0).unwrap()),
                100,
            )
            .unwrap();
        let shas: Vec<&str> = ranged.iter().map(|p| p.commit_sha.as_str()).collect();
        assert_eq!(shas, vec!["b", "c"]);

        assert!(db
            .list_predictions("other/repo", None, None, 100)
            .unwrap()
            .is_empty());
    }
}

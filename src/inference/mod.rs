//! Inference adapter
//!
//! Wraps versioned classifiers behind the `classify` contract. The model
//! version is always an explicit argument and is never substituted.

mod artifact;

pub use artifact::{ArtifactStore, LinearModel, ModelArtifact};

use crate::model::FeatureVector;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Allowed deviation of a probability distribution's sum from 1
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

/// Errors raised while loading or running a classifier
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model {version} unavailable: {reason}")]
    ModelUnavailable { version: String, reason: String },

    #[error("model {version} timed out after {timeout:?}")]
    ModelTimeout { version: String, timeout: Duration },

    #[error("invalid model artifact {version}: {detail}")]
    InvalidArtifact { version: String, detail: String },
}

/// Output of one classification
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub predicted_class: String,
    /// Expected severity rank scaled to `[0, 1]`
    pub severity_score: f64,
    pub probability_distribution: BTreeMap<String, f64>,
}

impl Classification {
    /// Build a classification from per-class probabilities.
    ///
    /// `classes` are ordered from lowest to highest severity. Probabilities
    /// are renormalized; ties in the argmax go to the lower class.
    pub fn from_probabilities(
        version: &str,
        classes: &[String],
        probabilities: &[f64],
    ) -> Result<Self, InferenceError> {
        let invalid = |detail: String| InferenceError::InvalidArtifact {
            version: version.to_string(),
            detail,
        };

        if classes.is_empty() || classes.len() != probabilities.len() {
            return Err(invalid(format!(
                "{} classes but {} probabilities",
                classes.len(),
                probabilities.len()
            )));
        }
        if probabilities.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(invalid("probabilities must be finite and non-negative".into()));
        }

        let total: f64 = probabilities.iter().sum();
        if total <= 0.0 {
            return Err(invalid("probabilities sum to zero".into()));
        }
        let normalized: Vec<f64> = probabilities.iter().map(|p| p / total).collect();

        let mut best = 0;
        for (i, p) in normalized.iter().enumerate() {
            if *p > normalized[best] {
                best = i;
            }
        }

        Ok(Self {
            predicted_class: classes[best].clone(),
            severity_score: severity_score(&normalized),
            probability_distribution: classes.iter().cloned().zip(normalized).collect(),
        })
    }

    /// Check the distribution sums to 1 and the score matches it
    pub fn is_consistent(&self, classes: &[String]) -> bool {
        let total: f64 = self.probability_distribution.values().sum();
        let ordered: Option<Vec<f64>> = classes
            .iter()
            .map(|c| self.probability_distribution.get(c).copied())
            .collect();

        match ordered {
            Some(ordered) => {
                (total - 1.0).abs() <= PROBABILITY_TOLERANCE
                    && (severity_score(&ordered) - self.severity_score).abs()
                        <= PROBABILITY_TOLERANCE
            }
            None => false,
        }
    }
}

/// Expected class rank scaled to `[0, 1]`: `sum(p_i * i) / (n - 1)`.
///
/// Probabilities are ordered from lowest to highest severity. A single
/// class scores 0.
pub fn severity_score(probabilities: &[f64]) -> f64 {
    if probabilities.len() < 2 {
        return 0.0;
    }

    let top = (probabilities.len() - 1) as f64;
    probabilities
        .iter()
        .enumerate()
        .map(|(i, p)| p * i as f64)
        .sum::<f64>()
        / top
}

/// A loaded classifier for one model version
#[async_trait]
pub trait Classifier: Send + Sync {
    fn version(&self) -> &str;

    /// Class labels ordered from lowest to highest severity
    fn classes(&self) -> &[String];

    /// Per-class probabilities in the order of [`Classifier::classes`]
    async fn probabilities(&self, features: &FeatureVector) -> Result<Vec<f64>, InferenceError>;
}

/// Source of classifiers keyed by model version
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn load(&self, version: &str) -> Result<Arc<dyn Classifier>, InferenceError>;
}

/// Classifies feature vectors with a pinned model version under a deadline
#[derive(Clone)]
pub struct InferenceAdapter {
    store: Arc<dyn ModelStore>,
    timeout: Duration,
}

impl InferenceAdapter {
    pub fn new(store: Arc<dyn ModelStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Classify `features` with exactly `model_version`.
    ///
    /// Loading and scoring share one deadline.
    pub async fn classify(
        &self,
        features: &FeatureVector,
        model_version: &str,
    ) -> Result<Classification, InferenceError> {
        let work = async {
            let classifier = self.store.load(model_version).await?;
            if classifier.version() != model_version {
                return Err(InferenceError::ModelUnavailable {
                    version: model_version.to_string(),
                    reason: format!("store returned version {}", classifier.version()),
                });
            }
            let probabilities = classifier.probabilities(features).await?;
            Classification::from_probabilities(model_version, classifier.classes(), &probabilities)
        };

        let classification = tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| InferenceError::ModelTimeout {
                version: model_version.to_string(),
                timeout: self.timeout,
            })??;

        debug!(
            model_version,
            predicted_class = %classification.predicted_class,
            severity_score = classification.severity_score,
            "Classified feature vector"
        );

        Ok(classification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes() -> Vec<String> {
        ["low", "medium", "high", "critical"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    struct SlowClassifier {
        classes: Vec<String>,
    }

    #[async_trait]
    impl Classifier for SlowClassifier {
        fn version(&self) -> &str {
            "slow"
        }

        fn classes(&self) -> &[String] {
            &self.classes
        }

        async fn probabilities(&self, _: &FeatureVector) -> Result<Vec<f64>, InferenceError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![1.0; self.classes.len()])
        }
    }

    struct SlowStore;

    #[async_trait]
    impl ModelStore for SlowStore {
        async fn load(&self, version: &str) -> Result<Arc<dyn Classifier>, InferenceError> {
            if version != "slow" {
                return Err(InferenceError::ModelUnavailable {
                    version: version.to_string(),
                    reason: "not found".to_string(),
                });
            }
            Ok(Arc::new(SlowClassifier { classes: classes() }))
        }
    }

    #[test]
    fn test_severity_score_bounds() {
        assert_eq!(severity_score(&[1.0, 0.0, 0.0, 0.0]), 0.0);
        assert_eq!(severity_score(&[0.0, 0.0, 0.0, 1.0]), 1.0);
        assert!((severity_score(&[0.25, 0.25, 0.25, 0.25]) - 0.5).abs() < 1e-12);
        assert_eq!(severity_score(&[1.0]), 0.0);
    }

    #[test]
    fn test_from_probabilities_normalizes() {
        let c = Classification::from_probabilities("v1", &classes(), &[1.0, 1.0, 2.0, 0.0])
            .unwrap();
        assert_eq!(c.predicted_class, "high");
        assert!((c.probability_distribution["high"] - 0.5).abs() < 1e-12);
        assert!(c.is_consistent(&classes()));
    }

    #[test]
    fn test_argmax_tie_goes_to_lower_class() {
        let c = Classification::from_probabilities("v1", &classes(), &[0.4, 0.4, 0.1, 0.1])
            .unwrap();
        assert_eq!(c.predicted_class, "low");
    }

    #[test]
    fn test_rejects_bad_distributions() {
        assert!(Classification::from_probabilities("v1", &classes(), &[1.0]).is_err());
        assert!(Classification::from_probabilities("v1", &classes(), &[0.0; 4]).is_err());
        assert!(
            Classification::from_probabilities("v1", &classes(), &[f64::NAN, 1.0, 0.0, 0.0])
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_timeout() {
        let adapter = InferenceAdapter::new(Arc::new(SlowStore), Duration::from_millis(100));
        let err = adapter
            .classify(&FeatureVector::new(), "slow")
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::ModelTimeout { .. }));
    }

    #[tokio::test]
    async fn test_unknown_version_is_not_substituted() {
        let adapter = InferenceAdapter::new(Arc::new(SlowStore), Duration::from_millis(100));
        let err = adapter
            .classify(&FeatureVector::new(), "v9")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InferenceError::ModelUnavailable { ref version, .. } if version == "v9"
        ));
    }
}

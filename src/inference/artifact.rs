//! File-backed model artifacts
//!
//! An artifact is a JSON file `<model_dir>/<version>.json` describing a
//! multinomial linear classifier:
//!
//! ```json
//! {
//!   "version": "v1",
//!   "classes": ["low", "medium", "high", "critical"],
//!   "bias": [0.4, 0.1, -0.2, -0.6],
//!   "weights": { "abs_churn": [-0.01, 0.0, 0.005, 0.01] }
//! }
//! ```
//!
//! Features missing from the vector count as zero; features the artifact
//! has no weights for are ignored.

use super::{Classifier, InferenceError, ModelStore};
use crate::model::FeatureVector;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Serialized form of a model artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: String,
    /// Class labels ordered from lowest to highest severity
    pub classes: Vec<String>,
    pub bias: Vec<f64>,
    #[serde(default)]
    pub weights: BTreeMap<String, Vec<f64>>,
}

/// Softmax classifier over a linear score per class
#[derive(Debug, Clone)]
pub struct LinearModel {
    version: String,
    classes: Vec<String>,
    bias: Vec<f64>,
    weights: BTreeMap<String, Vec<f64>>,
}

impl LinearModel {
    pub fn from_artifact(version: &str, artifact: ModelArtifact) -> Result<Self, InferenceError> {
        let invalid = |detail: String| InferenceError::InvalidArtifact {
            version: version.to_string(),
            detail,
        };

        if artifact.version != version {
            return Err(invalid(format!(
                "file declares version {}",
                artifact.version
            )));
        }
        if artifact.classes.is_empty() {
            return Err(invalid("no classes".into()));
        }
        let unique: BTreeSet<&String> = artifact.classes.iter().collect();
        if unique.len() != artifact.classes.len() {
            return Err(invalid("duplicate class labels".into()));
        }

        let n = artifact.classes.len();
        if artifact.bias.len() != n {
            return Err(invalid(format!("bias has {} entries, expected {}", artifact.bias.len(), n)));
        }
        for (feature, row) in &artifact.weights {
            if row.len() != n {
                return Err(invalid(format!(
                    "weights for {} have {} entries, expected {}",
                    feature,
                    row.len(),
                    n
                )));
            }
        }
        let all_finite = artifact
            .bias
            .iter()
            .chain(artifact.weights.values().flatten())
            .all(|w| w.is_finite());
        if !all_finite {
            return Err(invalid("non-finite parameter".into()));
        }

        Ok(Self {
            version: artifact.version,
            classes: artifact.classes,
            bias: artifact.bias,
            weights: artifact.weights,
        })
    }

    /// Linear score of each class
    pub fn logits(&self, features: &FeatureVector) -> Vec<f64> {
        let mut logits = self.bias.clone();
        for (feature, row) in &self.weights {
            let value = match features.get(feature) {
                Some(v) if v.is_finite() => *v,
                _ => continue,
            };
            for (logit, weight) in logits.iter_mut().zip(row) {
                *logit += weight * value;
            }
        }
        logits
    }
}

#[async_trait]
impl Classifier for LinearModel {
    fn version(&self) -> &str {
        &self.version
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }

    async fn probabilities(&self, features: &FeatureVector) -> Result<Vec<f64>, InferenceError> {
        let logits = self.logits(features);
        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exp: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f64 = exp.iter().sum();

        if !total.is_finite() || total <= 0.0 {
            return Err(InferenceError::InvalidArtifact {
                version: self.version.clone(),
                detail: "scores overflowed".to_string(),
            });
        }

        Ok(exp.into_iter().map(|e| e / total).collect())
    }
}

/// Loads artifacts from a directory and caches them per version
pub struct ArtifactStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, Arc<dyn Classifier>>>,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn artifact_path(&self, version: &str) -> Result<PathBuf, InferenceError> {
        let valid = !version.is_empty()
            && version != "."
            && version != ".."
            && !version.contains(['/', '\\']);
        if !valid {
            return Err(InferenceError::ModelUnavailable {
                version: version.to_string(),
                reason: "invalid version identifier".to_string(),
            });
        }
        Ok(self.dir.join(format!("{}.json", version)))
    }
}

#[async_trait]
impl ModelStore for ArtifactStore {
    async fn load(&self, version: &str) -> Result<Arc<dyn Classifier>, InferenceError> {
        let cached = self.cache.read().await.get(version).cloned();
        if let Some(model) = cached {
            return Ok(model);
        }

        let path = self.artifact_path(version)?;
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            InferenceError::ModelUnavailable {
                version: version.to_string(),
                reason: format!("{}: {}", path.display(), e),
            }
        })?;

        let artifact: ModelArtifact =
            serde_json::from_str(&content).map_err(|e| InferenceError::InvalidArtifact {
                version: version.to_string(),
                detail: e.to_string(),
            })?;
        let model: Arc<dyn Classifier> = Arc::new(LinearModel::from_artifact(version, artifact)?);

        info!(
            version,
            path = %path.display(),
            classes = model.classes().len(),
            "Loaded model artifact"
        );

        self.cache
            .write()
            .await
            .insert(version.to_string(), model.clone());

        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{Classification, InferenceAdapter};
    use std::time::Duration;
    use tempfile::TempDir;

    fn artifact() -> ModelArtifact {
        let mut weights = BTreeMap::new();
        weights.insert("abs_churn".to_string(), vec![-0.01, 0.0, 0.01]);
        ModelArtifact {
            version: "v1".to_string(),
            classes: vec!["low".into(), "medium".into(), "high".into()],
            bias: vec![0.0, 0.0, 0.0],
            weights,
        }
    }

    fn write_artifact(dir: &Path, artifact: &ModelArtifact) {
        std::fs::write(
            dir.join(format!("{}.json", artifact.version)),
            serde_json::to_string_pretty(artifact).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_uniform_without_signal() {
        let model = LinearModel::from_artifact("v1", artifact()).unwrap();
        let probs = model.probabilities(&FeatureVector::new()).await.unwrap();
        for p in probs {
            assert!((p - 1.0 / 3.0).abs() < 1e-12);
        }
    }

    #[tokio::test]
    async fn test_large_churn_favours_high() {
        let model = LinearModel::from_artifact("v1", artifact()).unwrap();
        let mut features = FeatureVector::new();
        features.insert("abs_churn".to_string(), 500.0);
        features.insert("unknown_feature".to_string(), 1e9);

        let probs = model.probabilities(&features).await.unwrap();
        let c = Classification::from_probabilities("v1", model.classes(), &probs).unwrap();
        assert_eq!(c.predicted_class, "high");
        assert!(c.is_consistent(model.classes()));
    }

    #[test]
    fn test_rejects_inconsistent_artifact() {
        let mut bad = artifact();
        bad.bias.pop();
        assert!(LinearModel::from_artifact("v1", bad).is_err());

        assert!(LinearModel::from_artifact("v2", artifact()).is_err());

        let mut dup = artifact();
        dup.classes[1] = "low".into();
        assert!(LinearModel::from_artifact("v1", dup).is_err());
    }

    #[tokio::test]
    async fn test_store_loads_and_caches() {
        let dir = TempDir::new().unwrap();
        write_artifact(dir.path(), &artifact());

        let store = ArtifactStore::new(dir.path());
        let first = store.load("v1").await.unwrap();
        assert_eq!(first.version(), "v1");

        // Cached copy survives the file going away
        std::fs::remove_file(dir.path().join("v1.json")).unwrap();
        assert!(store.load("v1").await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_version_is_unavailable() {
        let dir = TempDir::new().unwrap();
        write_artifact(dir.path(), &artifact());
        let adapter =
            InferenceAdapter::new(Arc::new(ArtifactStore::new(dir.path())), Duration::from_secs(1));

        for version in ["v2", "../v1", ""] {
            let err = adapter
                .classify(&FeatureVector::new(), version)
                .await
                .unwrap_err();
            assert!(matches!(err, InferenceError::ModelUnavailable { .. }), "{}", version);
        }
    }
}

//! Pipeline configuration and workspace layout
//!
//! Configuration lives in `<root>/.bugsage/config.toml`. Every field has a
//! default so partial files load.

use crate::features::{default_windows, is_builtin_feature, WindowError, WindowSpec};
use crate::model::Severity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Name of the per-workspace data directory
pub const DATA_DIR: &str = ".bugsage";

/// Errors loading, saving or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Window(#[from] WindowError),
}

/// Retry policy for transient failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before an event is parked
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_backoff_ms`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Configuration of the online pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Database file, relative to the data directory unless absolute
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Directory holding `<version>.json` model artifacts, relative to the
    /// data directory unless absolute
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Model version pinned on every prediction
    #[serde(default = "default_model_version")]
    pub model_version: String,

    /// Number of repository partitions processed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Events claimed per coordinator pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_inference_timeout_ms")]
    pub inference_timeout_ms: u64,

    /// How long a claimed event stays leased to its worker
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// Times a commit may wait for missing issues before it is featurized
    /// without them
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: u32,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Issue label (lowercase) to severity
    #[serde(default = "default_label_mapping")]
    pub label_mapping: BTreeMap<String, Severity>,

    #[serde(default = "default_windows")]
    pub windows: Vec<WindowSpec>,
}

fn default_database() -> PathBuf {
    PathBuf::from("bugsage.db")
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_model_version() -> String {
    "v1".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_batch_size() -> usize {
    256
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_inference_timeout_ms() -> u64 {
    5000
}

fn default_lease_ms() -> u64 {
    60_000
}

fn default_max_deferrals() -> u32 {
    5
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_label_mapping() -> BTreeMap<String, Severity> {
    [
        ("critical", Severity::Critical),
        ("blocker", Severity::Critical),
        ("high", Severity::High),
        ("major", Severity::High),
        ("medium", Severity::Medium),
        ("moderate", Severity::Medium),
        ("low", Severity::Low),
        ("minor", Severity::Low),
        ("trivial", Severity::Low),
    ]
    .into_iter()
    .map(|(label, severity)| (label.to_string(), severity))
    .collect()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            model_dir: default_model_dir(),
            model_version: default_model_version(),
            workers: default_workers(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            inference_timeout_ms: default_inference_timeout_ms(),
            lease_ms: default_lease_ms(),
            max_deferrals: default_max_deferrals(),
            retry: RetryPolicy::default(),
            label_mapping: default_label_mapping(),
            windows: default_windows(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from the workspace or return defaults
    pub fn load_or_default(root: &Path) -> Result<Self, ConfigError> {
        let config_path = root.join(DATA_DIR).join("config.toml");

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
            path: config_path.clone(),
            source,
        })?;
        let mut config: PipelineConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: config_path.clone(),
                source,
            })?;

        config.label_mapping = config
            .label_mapping
            .into_iter()
            .map(|(label, severity)| (label.trim().to_lowercase(), severity))
            .collect();

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the workspace
    pub fn save(&self, root: &Path) -> Result<(), ConfigError> {
        let data_dir = root.join(DATA_DIR);
        std::fs::create_dir_all(&data_dir).map_err(|source| ConfigError::Io {
            path: data_dir.clone(),
            source,
        })?;

        let config_path = data_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;

        std::fs::write(&config_path, content).map_err(|source| ConfigError::Io {
            path: config_path,
            source,
        })
    }

    /// Check values that would make the pipeline misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_version.trim().is_empty() {
            return Err(ConfigError::Invalid("model_version must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.inference_timeout_ms == 0 || self.lease_ms == 0 {
            return Err(ConfigError::Invalid(
                "inference_timeout_ms and lease_ms must be positive".into(),
            ));
        }
        if self.lease_ms <= self.inference_timeout_ms {
            return Err(ConfigError::Invalid(
                "lease_ms must exceed inference_timeout_ms".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry.base_backoff_ms exceeds retry.max_backoff_ms".into(),
            ));
        }

        let mut names = BTreeSet::new();
        for spec in &self.windows {
            spec.validate()?;
            let name = spec.feature_name();
            if is_builtin_feature(&name) {
                return Err(ConfigError::Invalid(format!(
                    "window name {} is a built-in feature",
                    name
                )));
            }
            if !names.insert(name.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate window {}", name)));
            }
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

/// Directory layout of a BugSage workspace
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    config: PipelineConfig,
}

impl Workspace {
    /// Open a workspace rooted at `root`, loading its configuration
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, ConfigError> {
        let root = root.as_ref().to_path_buf();
        let config = PipelineConfig::load_or_default(&root)?;
        Ok(Self { root, config })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut PipelineConfig {
        &mut self.config
    }

    /// Path to the `.bugsage` directory
    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn is_initialized(&self) -> bool {
        self.data_dir().is_dir()
    }

    /// Create the data and model directories if they don't exist
    pub fn init_data_dir(&self) -> Result<PathBuf, ConfigError> {
        let data_dir = self.data_dir();
        for dir in [data_dir.clone(), self.model_dir()] {
            std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.config.database)
    }

    pub fn model_dir(&self) -> PathBuf {
        self.resolve(&self.config.model_dir)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir().join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.label_mapping["blocker"], Severity::Critical);
        assert!(!config.windows.is_empty());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 10,
            base_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(4), Duration::from_millis(800));
        assert_eq!(retry.backoff(5), Duration::from_millis(1000));
        assert_eq!(retry.backoff(200), Duration::from_millis(1000));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(DATA_DIR)).unwrap();
        std::fs::write(
            dir.path().join(DATA_DIR).join("config.toml"),
            r#"
            model_version = "v7"
            workers = 2

            [label_mapping]
            "P0" = "critical"

            [[windows]]
            window = "3d"
            metric = "count"
            scope = "repo"
            subject = "issues"
            "#,
        )
        .unwrap();

        let config = PipelineConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.model_version, "v7");
        assert_eq!(config.workers, 2);
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.label_mapping["p0"], Severity::Critical);
        assert_eq!(config.windows.len(), 1);
        assert_eq!(config.windows[0].feature_name(), "repo_issues_count_3d");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut config = PipelineConfig::default();
        config.model_version = "v2".to_string();
        config.save(dir.path()).unwrap();

        let loaded = PipelineConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let mut config = PipelineConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.windows.push(config.windows[0].clone());
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.lease_ms = config.inference_timeout_ms;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_window_shadowing_builtin_feature() {
        let mut config = PipelineConfig::default();
        let mut spec = config.windows[0].clone();
        spec.name = Some("repo_open_issues".to_string());
        config.windows.push(spec);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("repo_open_issues"));

        let mut config = PipelineConfig::default();
        config.windows[0].name = Some("kw_fix".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_lookback() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(DATA_DIR)).unwrap();
        std::fs::write(
            dir.path().join(DATA_DIR).join("config.toml"),
            r#"
            [[windows]]
            window = "100000000d"
            metric = "count"
            scope = "repo"
            subject = "commits"
            "#,
        )
        .unwrap();

        assert!(PipelineConfig::load_or_default(dir.path()).is_err());
    }

    #[test]
    fn test_workspace_paths() {
        let dir = TempDir::new().unwrap();
        let workspace = Workspace::open(dir.path()).unwrap();
        assert!(!workspace.is_initialized());

        workspace.init_data_dir().unwrap();
        assert!(workspace.is_initialized());
        assert!(workspace.model_dir().is_dir());
        assert_eq!(
            workspace.database_path(),
            dir.path().join(DATA_DIR).join("bugsage.db")
        );
    }
}

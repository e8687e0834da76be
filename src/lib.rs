//! BugSage - Real-time defect severity prediction
//!
//! This library turns a stream of out-of-order, possibly duplicated
//! repository events into causally valid feature vectors and idempotent,
//! versioned severity predictions.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod features;
pub mod inference;
pub mod links;
pub mod model;
pub mod pipeline;
pub mod repo;
pub mod storage;

/// Re-export commonly used types
pub use config::{PipelineConfig, Workspace};
pub use error::PipelineError;
pub use events::{Event, EventState, NewEvent};
pub use model::{Commit, FeatureRecord, Issue, Prediction, Severity};
pub use pipeline::{Coordinator, RunSummary};
pub use storage::Database;

/// Application-wide error type
pub use anyhow::Result;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = "bugsage";

//! Pipeline error taxonomy
//!
//! Every failure while processing an event maps to one [`Disposition`]
//! that decides the event's next state.

use crate::events::PayloadError;
use crate::inference::InferenceError;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors raised while driving an event through the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient storage error: {0}")]
    TransientStorage(#[source] StorageError),

    #[error("data incomplete: {0}")]
    DataIncomplete(String),

    #[error("model {version} unavailable: {reason}")]
    ModelUnavailable { version: String, reason: String },

    #[error("model {version} timed out")]
    ModelTimeout { version: String },

    #[error("malformed event: {0}")]
    MalformedEvent(#[from] PayloadError),

    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    #[error("processing crashed: {0}")]
    Crashed(String),
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        if err.is_transient() {
            PipelineError::TransientStorage(err)
        } else {
            PipelineError::Storage(err)
        }
    }
}

impl From<InferenceError> for PipelineError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::ModelTimeout { version, .. } => PipelineError::ModelTimeout { version },
            InferenceError::ModelUnavailable { version, reason } => {
                PipelineError::ModelUnavailable { version, reason }
            }
            InferenceError::InvalidArtifact { version, detail } => {
                PipelineError::ModelUnavailable {
                    version,
                    reason: format!("invalid artifact: {}", detail),
                }
            }
        }
    }
}

/// What happens to an event after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Mark `failed` and retry with backoff until attempts run out
    Retry,
    /// Mark `deferred` and re-queue until the missing data arrives
    Defer,
    /// Mark `parked` for manual inspection and raise an alert
    Park,
    /// Mark `skipped`; the event stays in the Event Store for audit
    Skip,
}

impl PipelineError {
    pub fn disposition(&self) -> Disposition {
        match self {
            PipelineError::TransientStorage(_)
            | PipelineError::ModelTimeout { .. }
            | PipelineError::Crashed(_) => Disposition::Retry,
            PipelineError::DataIncomplete(_) => Disposition::Defer,
            PipelineError::ModelUnavailable { .. } | PipelineError::Storage(_) => {
                Disposition::Park
            }
            PipelineError::MalformedEvent(_) => Disposition::Skip,
        }
    }

    /// Short machine-readable reason recorded on the event status
    pub fn reason_code(&self) -> &'static str {
        match self {
            PipelineError::TransientStorage(_) => "TransientStorage",
            PipelineError::DataIncomplete(_) => "DataIncomplete",
            PipelineError::ModelUnavailable { .. } => "ModelUnavailable",
            PipelineError::ModelTimeout { .. } => "ModelTimeout",
            PipelineError::MalformedEvent(_) => "MalformedEvent",
            PipelineError::Storage(_) => "Storage",
            PipelineError::Crashed(_) => "Crashed",
        }
    }
}

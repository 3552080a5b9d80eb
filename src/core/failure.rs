//! Failure taxonomy for pipeline execution.

use thiserror::Error;

use crate::adapters::GenerateError;

/// All the ways a job can fail to make progress.
#[derive(Debug, Clone, Error)]
pub enum PipelineFailure {
    /// Malformed prompt or malformed stage response
    #[error("validation failure: {0}")]
    Validation(String),

    /// Retriable provider error (timeout, rate limit, 5xx)
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Policy refusal or unrecoverable schema mismatch
    #[error("permanent provider failure: {0}")]
    Permanent(String),

    /// One or more sections remained unrecoverable after retries
    #[error("assembly failure: {0}")]
    Assembly(String),

    /// Cancellation was observed at a checkpoint
    #[error("generation stopped by user")]
    Cancelled,

    /// The job was evicted or never existed
    #[error("job not found")]
    JobNotFound,
}

impl PipelineFailure {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// A transient failure that exhausted its retry budget escalates to
    /// permanent; everything else is already as severe as it gets.
    pub fn escalated(self) -> Self {
        match self {
            Self::Transient(message) => Self::Permanent(format!("retries exhausted: {message}")),
            other => other,
        }
    }
}

impl From<GenerateError> for PipelineFailure {
    fn from(error: GenerateError) -> Self {
        match error {
            GenerateError::Transient(message) => Self::Transient(message),
            GenerateError::Permanent(message) => Self::Permanent(message),
        }
    }
}

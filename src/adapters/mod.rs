//! Generation Service interface.
//!
//! Adapters provide a unified seam between the pipeline and whatever backend
//! actually produces text. The stage executor builds a [`GenerationRequest`]
//! deterministically from pipeline context; the adapter returns raw text or a
//! typed failure classified as transient (worth retrying) or permanent.

pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use openai::OpenAiGenerator;

/// Which pipeline stage a request belongs to. Carried on every request so
/// adapters and test doubles can attribute calls without parsing prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Infer,
    Guidance,
    Outline,
    FirstPart,
    Section { index: usize },
    QcReview,
    QcFix,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Infer => "infer",
            Self::Guidance => "guidance",
            Self::Outline => "outline",
            Self::FirstPart => "first_part",
            Self::Section { .. } => "section",
            Self::QcReview => "qc_review",
            Self::QcFix => "qc_fix",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Section { index } => write!(f, "section[{index}]"),
            other => f.write_str(other.name()),
        }
    }
}

/// A single model-facing request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub stage: StageKind,

    /// System instruction block
    pub system: String,

    /// User content built from the accumulated context subset for this stage
    pub user: String,

    pub temperature: f32,

    pub max_tokens: Option<u32>,

    /// Ask the backend for a strict JSON object response
    pub json: bool,
}

/// Failure from a generation backend.
///
/// Transient failures (timeouts, rate limits, 5xx) are retried by the stage
/// executor within a bounded policy; permanent failures (policy refusals,
/// schema mismatches, client errors) escalate immediately.
#[derive(Debug, Clone, Error)]
pub enum GenerateError {
    #[error("transient generation failure: {0}")]
    Transient(String),

    #[error("permanent generation failure: {0}")]
    Permanent(String),
}

impl GenerateError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Trait for generation backends.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Execute one generation call. Implementations must respect `timeout`
    /// and classify an elapsed deadline as transient. Dropping the returned
    /// future is a best-effort cancellation of the underlying call.
    async fn generate(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<String, GenerateError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::Infer.to_string(), "infer");
        assert_eq!(StageKind::Section { index: 4 }.to_string(), "section[4]");
        assert_eq!(StageKind::Section { index: 4 }.name(), "section");
    }

    #[test]
    fn test_error_classification() {
        assert!(GenerateError::Transient("rate limited".into()).is_transient());
        assert!(!GenerateError::Permanent("refused".into()).is_transient());
    }
}

//! Job state for a single generation request.
//!
//! A Job is owned by the registry; the orchestrator running on its behalf is
//! the only writer of status transitions, and the cancellation supervisor
//! only flips the cancellation token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::PipelineContext;

/// A generation job and its lifecycle state.
#[derive(Debug, Clone)]
pub struct Job {
    /// Opaque unique identifier
    pub id: Uuid,

    /// The original free-text brief
    pub prompt: String,

    /// Current lifecycle status
    pub status: JobStatus,

    /// When the job was created
    pub created_at: DateTime<Utc>,

    /// When the job reached a terminal status; starts the retention window
    pub completed_at: Option<DateTime<Utc>>,

    /// Cooperative stop signal, checked by the orchestrator and every
    /// fan-out task at suspension boundaries
    pub cancel: CancellationToken,

    /// Accumulated stage outputs, written through the registry as the
    /// pipeline progresses
    pub context: PipelineContext,
}

impl Job {
    pub fn new(prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        Self {
            id: Uuid::new_v4(),
            context: PipelineContext::new(prompt.clone()),
            prompt,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, pipeline not yet started
    Pending,

    /// Pipeline in progress
    Running,

    /// Completed successfully; final HTML fully appended to the event buffer
    Done,

    /// Failed on an unrecoverable stage or section
    Error,

    /// Cancellation completed before natural termination
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Stopped)
    }
}

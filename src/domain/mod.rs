//! Domain types for the scrivener orchestrator.
//!
//! This module contains the core data structures:
//! - Events: ordered, immutable records delivered to subscribers
//! - Job: lifecycle state for one generation request
//! - Context: typed stage outputs accumulated across the pipeline

pub mod context;
pub mod events;
pub mod job;

// Re-export commonly used types
pub use context::{FirstPart, Guidance, PipelineContext, SectionContext, SectionPlan, Variables};
pub use events::{Event, EventPayload, ProgressMarker};
pub use job::{Job, JobStatus};

//! Event types for job streaming.
//!
//! Every state change a client can observe is recorded as an immutable event
//! in the job's ordered replay buffer. Events carry a per-job sequence number;
//! a subscriber that replays the buffer and then follows the live channel sees
//! the exact same totally-ordered history as one attached from the start.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::{SectionPlan, Variables};

/// A single event in a job's ordered event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The job this event belongs to
    pub job_id: Uuid,

    /// Per-job sequence number, starting at 0 with no gaps
    pub seq: u64,

    /// When this event was published
    pub timestamp: DateTime<Utc>,

    /// What happened
    pub payload: EventPayload,
}

impl Event {
    pub fn new(job_id: Uuid, seq: u64, payload: EventPayload) -> Self {
        Self {
            job_id,
            seq,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Whether this event ends the job's event sequence.
    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }
}

/// Tagged event payload, mirrored onto the wire as the SSE event name plus
/// its data body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// The pipeline has started running
    Start,

    /// Inferred document variables (stage 1 output)
    Variables(Variables),

    /// The clamped outline (stage 3 output)
    Outline(Vec<SectionPlan>),

    /// A coarse progress marker for stages without a structured payload
    Progress(ProgressMarker),

    /// One slice of the final sanitized HTML
    Chunk(String),

    /// Terminal failure with a human-readable cause
    Error(String),

    /// Terminal success marker; always the last event of a finished or
    /// stopped job
    Done,
}

impl EventPayload {
    /// Wire name of this event, used as the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Variables(_) => "variables",
            Self::Outline(_) => "outline",
            Self::Progress(_) => "progress",
            Self::Chunk(_) => "chunk",
            Self::Error(_) => "error",
            Self::Done => "done",
        }
    }

    /// `done` and `error` close the event sequence; at most one of them
    /// exists per job and it is always last.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }
}

/// Progress markers emitted between structured events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMarker {
    /// Drafting guidance is available to subsequent stages
    GuidelinesReady,

    /// Front matter and global definitions are drafted
    FirstPartReady,

    /// Anchor and all fan-out sections are drafted
    SectionsDone,

    /// Cancellation was observed; a terminal `done` follows
    Stopped,
}

impl ProgressMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GuidelinesReady => "guidelines_ready",
            Self::FirstPartReady => "first_part_ready",
            Self::SectionsDone => "sections_done",
            Self::Stopped => "stopped",
        }
    }
}

//! scrivener - prompt-to-document generation service
//!
//! Turns a short free-text brief into a long structured HTML document
//! through a staged LLM pipeline: infer variables, draft private guidance,
//! plan an outline, write the front matter, draft every section (anchor
//! first, then bounded parallel fan-out), then a consolidated QC pass.
//! Progress streams to clients over SSE, with full replay for late or
//! reconnecting subscribers.
//!
//! # Modules
//!
//! - `adapters`: Generation Service clients (OpenAI-compatible chat API)
//! - `core`: job registry, event broker, stage execution, orchestrator
//! - `domain`: events, jobs, and typed stage outputs
//! - `server`: HTTP surface (submit, stream, stop, health)
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the HTTP server
//! scrivener serve
//!
//! # Generate one document from the terminal
//! scrivener generate "mutual NDA between two software companies" -o nda.html
//!
//! # Inspect resolved configuration
//! scrivener config
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod server;

// Re-export main types at crate root for convenience
pub use config::Config;
pub use core::{EventBroker, JobRegistry, Orchestrator, PipelineSettings};
pub use domain::{Event, EventPayload, Job, JobStatus};

//! Core engine: job registry, event broker, stage execution, and the
//! orchestrator that ties them together.

pub mod broker;
pub mod failure;
pub mod orchestrator;
pub mod registry;
pub mod sanitize;
pub mod stages;

pub use broker::{BrokerError, EventBroker, SubscriberId, Subscription};
pub use failure::PipelineFailure;
pub use orchestrator::{Orchestrator, PipelineSettings};
pub use registry::JobRegistry;
pub use sanitize::sanitize_html;
pub use stages::{QcReview, RetryPolicy, StageExecutor};

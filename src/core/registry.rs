//! In-memory job table with retention-window eviction.
//!
//! The registry is the single owned store for job state: creation, status
//! transitions, cooperative stop, and eviction all go through its lock. It is
//! injected into the orchestrator and the HTTP surface rather than living in
//! a global. Nothing survives the process; consumers must treat lookups as
//! volatile and tolerate `None` for ids they saw earlier.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{Job, JobStatus, PipelineContext};

use super::failure::PipelineFailure;

/// Owned store of all live jobs.
pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, Job>>,

    /// How long a terminal job stays queryable before eviction
    retention: Duration,
}

impl JobRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Allocate a new pending job. The pipeline run is not started here;
    /// callers spawn the orchestrator separately.
    pub async fn create(&self, prompt: impl Into<String>) -> Job {
        let job = Job::new(prompt);
        let mut jobs = self.jobs.lock().await;
        jobs.insert(job.id, job.clone());
        info!(job_id = %job.id, active_jobs = jobs.len(), "job created");
        job
    }

    /// Snapshot of a job's current state, or `None` if unknown or evicted.
    pub async fn get(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.lock().await.get(&job_id).cloned()
    }

    /// Transition `pending -> running`. Fails if the job vanished underneath
    /// the orchestrator before it started.
    pub async fn mark_running(&self, job_id: Uuid) -> Result<(), PipelineFailure> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or(PipelineFailure::JobNotFound)?;
        job.status = JobStatus::Running;
        Ok(())
    }

    /// Record a terminal status and the completion timestamp that starts the
    /// retention countdown.
    pub async fn mark_terminal(
        &self,
        job_id: Uuid,
        status: JobStatus,
    ) -> Result<(), PipelineFailure> {
        debug_assert!(status.is_terminal());
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or(PipelineFailure::JobNotFound)?;
        job.status = status;
        job.completed_at = Some(Utc::now());
        info!(job_id = %job_id, ?status, "job reached terminal status");
        Ok(())
    }

    /// Apply a mutation to a job's accumulated pipeline context under the
    /// registry lock. The orchestrator records each stage output through this
    /// so subscribers and late readers see a consistent snapshot via `get`.
    pub async fn update_context(
        &self,
        job_id: Uuid,
        update: impl FnOnce(&mut PipelineContext),
    ) -> Result<(), PipelineFailure> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or(PipelineFailure::JobNotFound)?;
        update(&mut job.context);
        Ok(())
    }

    /// Cancellation supervisor entry point: set the stop flag and return
    /// immediately. The running pipeline observes the flag at its next
    /// checkpoint. Returns `false` for unknown ids.
    pub async fn stop(&self, job_id: Uuid) -> bool {
        let jobs = self.jobs.lock().await;
        match jobs.get(&job_id) {
            Some(job) => {
                job.cancel.cancel();
                info!(job_id = %job_id, "stop requested");
                true
            }
            None => false,
        }
    }

    /// Evict jobs whose completion timestamp plus the retention window has
    /// elapsed, returning the evicted ids so callers can release the
    /// corresponding event channels.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let mut jobs = self.jobs.lock().await;
        let expired: Vec<Uuid> = jobs
            .iter()
            .filter(|(_, job)| {
                job.completed_at
                    .map(|done| done + retention <= now)
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            jobs.remove(id);
            debug!(job_id = %id, "job evicted");
        }

        expired
    }
}

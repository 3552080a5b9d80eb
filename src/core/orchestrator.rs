//! Pipeline orchestrator.
//!
//! Drives a job from `pending` to a terminal status through the fixed stage
//! order: infer, guidance, outline, first part, sections (anchor first, then
//! bounded parallel fan-out), QC + fix. The orchestrator owns all event
//! publication and all job status transitions; stage executors only talk to
//! the Generation Service. Cancellation is cooperative: the job's token is
//! checked before every stage, around every section task, and between chunk
//! emissions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::Generator;
use crate::domain::{
    EventPayload, FirstPart, Guidance, Job, JobStatus, PipelineContext, ProgressMarker,
    SectionContext, SectionPlan, Variables,
};

use super::broker::EventBroker;
use super::failure::PipelineFailure;
use super::registry::JobRegistry;
use super::sanitize::sanitize_html;
use super::stages::{RetryPolicy, StageExecutor};

/// Tunables for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Hard lower bound on outline length; a shorter outline fails the job
    pub outline_min_sections: usize,

    /// Hard upper bound on outline length; surplus is truncated from the end
    pub outline_max_sections: usize,

    /// Maximum concurrent section draft tasks
    pub max_parallel_sections: usize,

    /// Approximate per-section word target passed to the outline stage
    pub section_target_words: u32,

    /// Maximum characters per `chunk` event
    pub chunk_chars: usize,

    /// Optional pacing delay between chunk events
    pub chunk_delay: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            outline_min_sections: 10,
            outline_max_sections: 16,
            max_parallel_sections: 10,
            section_target_words: 600,
            chunk_chars: 512,
            chunk_delay: Duration::ZERO,
        }
    }
}

/// Main pipeline orchestrator. One `run` call drives one job end to end.
pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    broker: Arc<EventBroker>,
    executor: StageExecutor,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<JobRegistry>,
        broker: Arc<EventBroker>,
        generator: Arc<dyn Generator>,
        retry: RetryPolicy,
        call_timeout: Duration,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            registry,
            broker,
            executor: StageExecutor::new(generator, retry, call_timeout),
            settings,
        }
    }

    /// Execute the full pipeline for a previously created job. Never
    /// returns an error: every outcome is recorded on the job and its event
    /// channel.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn run(&self, job_id: Uuid) {
        let Some(job) = self.registry.get(job_id).await else {
            warn!("job vanished before the pipeline started");
            return;
        };

        if let Err(failure) = self.registry.mark_running(job_id).await {
            warn!(%failure, "could not mark job running");
            return;
        }
        self.publish(job_id, EventPayload::Start).await;
        info!("pipeline started");

        match self.drive(&job).await {
            Ok(()) => {
                self.publish(job_id, EventPayload::Done).await;
                self.finish(job_id, JobStatus::Done).await;
                info!("pipeline completed");
            }
            Err(failure) if failure.is_cancelled() => {
                self.publish(job_id, EventPayload::Progress(ProgressMarker::Stopped))
                    .await;
                self.publish(job_id, EventPayload::Done).await;
                self.finish(job_id, JobStatus::Stopped).await;
                info!("pipeline stopped by user");
            }
            Err(failure) => {
                error!(%failure, "pipeline failed");
                self.publish(job_id, EventPayload::Error(failure.to_string()))
                    .await;
                self.finish(job_id, JobStatus::Error).await;
            }
        }
    }

    /// Run stages 1-6 and stream the final HTML. Each stage output is
    /// recorded on the job's context through the registry before the next
    /// stage starts; assembly reads the sections back from that snapshot.
    /// Fatal failures propagate; the caller translates them into terminal
    /// state.
    async fn drive(&self, job: &Job) -> Result<(), PipelineFailure> {
        let cancel = &job.cancel;

        // 1) Infer
        checkpoint(cancel)?;
        let vars = self.executor.infer(&job.prompt).await?;
        self.record(job.id, |ctx| ctx.publish_variables(vars.clone()))
            .await;
        self.publish(job.id, EventPayload::Variables(vars.clone()))
            .await;

        // 2) Guidance
        checkpoint(cancel)?;
        let guidance = self.executor.guidance(&vars).await?;
        self.record(job.id, |ctx| ctx.publish_guidance(guidance.clone()))
            .await;
        self.publish(
            job.id,
            EventPayload::Progress(ProgressMarker::GuidelinesReady),
        )
        .await;

        // 3) Outline
        checkpoint(cancel)?;
        let mut outline = self
            .executor
            .outline(
                &vars,
                &guidance,
                &job.prompt,
                self.settings.section_target_words,
            )
            .await?;
        clamp_outline(
            &mut outline,
            self.settings.outline_min_sections,
            self.settings.outline_max_sections,
        )?;
        self.record(job.id, |ctx| ctx.publish_outline(outline.clone()))
            .await;
        self.publish(job.id, EventPayload::Outline(outline.clone()))
            .await;

        // 4) First part
        checkpoint(cancel)?;
        let first = self.executor.first_part(&vars, &outline).await?;
        self.record(job.id, |ctx| ctx.publish_first_part(first.clone()))
            .await;
        self.publish(
            job.id,
            EventPayload::Progress(ProgressMarker::FirstPartReady),
        )
        .await;

        // 5) Sections: anchor first, then bounded fan-out
        self.draft_sections(job, &vars, &guidance, &outline, &first)
            .await?;
        self.publish(job.id, EventPayload::Progress(ProgressMarker::SectionsDone))
            .await;

        // 6) QC + fix over the full assembly, read back from the job's
        // recorded context
        let snapshot = self
            .registry
            .get(job.id)
            .await
            .ok_or(PipelineFailure::JobNotFound)?;
        let first_part_html = snapshot
            .context
            .first_part()
            .map_or(first.html.as_str(), |fp| fp.html.as_str());
        let assembled = assemble(first_part_html, snapshot.context.sections());
        checkpoint(cancel)?;
        let review = self.executor.qc_review(&vars, &assembled).await?;
        let fixed = if review.should_fix {
            checkpoint(cancel)?;
            info!(issues = review.issues.len(), "running consolidated fix pass");
            self.executor.qc_fix(&vars, &assembled, &review.issues).await?
        } else {
            assembled
        };

        let final_html = sanitize_html(&fixed);
        self.record(job.id, |ctx| ctx.publish_final_html(final_html.clone()))
            .await;
        self.stream_chunks(job, &final_html).await
    }

    /// Draft the anchor section synchronously, then the rest concurrently.
    ///
    /// The anchor is the first outline section that is not literally
    /// "Definitions"; its HTML joins the shared context before any sibling
    /// draft call is issued (the ordering barrier). A sibling failure never
    /// aborts the others; once every task has finished, any unrecoverable
    /// section fails the job. Completed sections are recorded on the job's
    /// context as they land.
    async fn draft_sections(
        &self,
        job: &Job,
        vars: &Variables,
        guidance: &Guidance,
        outline: &[SectionPlan],
        first: &FirstPart,
    ) -> Result<(), PipelineFailure> {
        let Some((anchor_index, anchor_plan)) = outline
            .iter()
            .enumerate()
            .find(|(_, plan)| !plan.is_definitions())
            .or_else(|| outline.iter().enumerate().next())
        else {
            return Err(PipelineFailure::Validation(
                "outline has no sections to draft".to_string(),
            ));
        };

        checkpoint(&job.cancel)?;
        info!(
            anchor_index,
            anchor_title = %anchor_plan.title,
            "drafting anchor section"
        );
        let anchor_html = self
            .executor
            .draft_section(
                anchor_index,
                anchor_plan,
                &SectionContext {
                    variables: vars.clone(),
                    guidance_html: guidance.html.clone(),
                    first_part_html: first.html.clone(),
                    shared_context: first.context.clone(),
                    anchor_html: String::new(),
                },
            )
            .await?;
        self.record(job.id, |ctx| {
            ctx.publish_section(anchor_index, anchor_html.clone())
        })
        .await;

        let shared = Arc::new(SectionContext {
            variables: vars.clone(),
            guidance_html: guidance.html.clone(),
            first_part_html: first.html.clone(),
            shared_context: first.context.clone(),
            anchor_html: anchor_html.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel_sections.max(1)));
        let mut tasks: JoinSet<(usize, Result<String, PipelineFailure>)> = JoinSet::new();

        for (index, plan) in outline.iter().enumerate() {
            if index == anchor_index {
                continue;
            }
            let plan = plan.clone();
            let shared = Arc::clone(&shared);
            let semaphore = Arc::clone(&semaphore);
            let executor = self.executor.clone();
            let cancel = job.cancel.clone();

            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, Err(PipelineFailure::Cancelled)),
                };
                if cancel.is_cancelled() {
                    return (index, Err(PipelineFailure::Cancelled));
                }
                let result = executor.draft_section(index, &plan, &shared).await;
                if cancel.is_cancelled() {
                    // A call already in flight when stop arrived is discarded
                    return (index, Err(PipelineFailure::Cancelled));
                }
                (index, result)
            });
        }

        let mut failures: Vec<(usize, PipelineFailure)> = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(html))) => {
                    self.record(job.id, |ctx| ctx.publish_section(index, html))
                        .await;
                }
                Ok((index, Err(failure))) => failures.push((index, failure)),
                Err(join_error) => failures.push((
                    usize::MAX,
                    PipelineFailure::Assembly(format!("section task failed: {join_error}")),
                )),
            }
        }

        if job.cancel.is_cancelled() {
            return Err(PipelineFailure::Cancelled);
        }

        failures.sort_by_key(|(index, _)| *index);
        if let Some((index, failure)) = failures.into_iter().next() {
            if failure.is_cancelled() {
                return Err(PipelineFailure::Cancelled);
            }
            let detail = outline
                .get(index)
                .map(|plan| format!("section {} '{}'", plan.number, plan.title))
                .unwrap_or_else(|| "section task".to_string());
            return Err(PipelineFailure::Assembly(format!(
                "{detail} unrecoverable after retries: {failure}"
            )));
        }

        Ok(())
    }

    /// Emit the final HTML as a bounded sequence of chunk events.
    async fn stream_chunks(&self, job: &Job, html: &str) -> Result<(), PipelineFailure> {
        for chunk in chunk_text(html, self.settings.chunk_chars) {
            checkpoint(&job.cancel)?;
            self.publish(job.id, EventPayload::Chunk(chunk)).await;
            if !self.settings.chunk_delay.is_zero() {
                tokio::time::sleep(self.settings.chunk_delay).await;
            }
        }
        Ok(())
    }

    /// Record a stage output on the job's context, tolerating a job evicted
    /// underneath a straggling run.
    async fn record(&self, job_id: Uuid, update: impl FnOnce(&mut PipelineContext)) {
        if let Err(failure) = self.registry.update_context(job_id, update).await {
            warn!(%failure, "could not record stage output");
        }
    }

    /// Publish tolerating a job evicted underneath a straggling run.
    async fn publish(&self, job_id: Uuid, payload: EventPayload) {
        if let Err(error) = self.broker.publish(job_id, payload).await {
            warn!(%error, "event publish failed");
        }
    }

    async fn finish(&self, job_id: Uuid, status: JobStatus) {
        if let Err(failure) = self.registry.mark_terminal(job_id, status).await {
            warn!(%failure, "could not record terminal status");
        }
    }
}

/// Return `Cancelled` as soon as a stop request has been observed.
fn checkpoint(cancel: &CancellationToken) -> Result<(), PipelineFailure> {
    if cancel.is_cancelled() {
        Err(PipelineFailure::Cancelled)
    } else {
        Ok(())
    }
}

/// Enforce the outline contract: truncate surplus sections from the end,
/// fail on deficiency, and fill in missing section numbers.
fn clamp_outline(
    outline: &mut Vec<SectionPlan>,
    min: usize,
    max: usize,
) -> Result<(), PipelineFailure> {
    if outline.len() < min {
        return Err(PipelineFailure::Validation(format!(
            "outline produced {} sections, at least {min} required",
            outline.len()
        )));
    }
    if outline.len() > max {
        outline.truncate(max);
    }
    for (i, plan) in outline.iter_mut().enumerate() {
        if plan.number.trim().is_empty() {
            plan.number = format!("{}.", i + 1);
        }
    }
    Ok(())
}

/// Concatenate front matter and sections in outline order regardless of
/// completion order.
fn assemble(first_part_html: &str, sections: &BTreeMap<usize, String>) -> String {
    let mut out = String::with_capacity(
        first_part_html.len() + sections.values().map(|s| s.len() + 1).sum::<usize>(),
    );
    out.push_str(first_part_html);
    for html in sections.values() {
        out.push('\n');
        out.push_str(html);
    }
    out
}

/// Split text into chunks of at most `size` characters on char boundaries.
fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;

    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count == size {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

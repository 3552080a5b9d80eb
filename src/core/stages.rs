//! Per-stage request building, response validation, and retry handling.
//!
//! The executor is the only component that talks to the Generation Service.
//! Requests are built deterministically from the context fields each stage is
//! allowed to read; responses are validated into typed results before they
//! reach the orchestrator. The executor never mutates job state and never
//! publishes events.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::adapters::{GenerationRequest, Generator, StageKind};
use crate::domain::{FirstPart, Guidance, SectionContext, SectionPlan, Variables};

use super::failure::PipelineFailure;

/// Retry policy for transient stage failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try)
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,

    /// Backoff multiplier applied per retry
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 400,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }
        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Outcome of the QC review call (stage 6, first half).
#[derive(Debug, Clone, Deserialize)]
pub struct QcReview {
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default = "default_should_fix")]
    pub should_fix: bool,
}

fn default_should_fix() -> bool {
    true
}

/// Stateless per-stage executor.
#[derive(Clone)]
pub struct StageExecutor {
    generator: Arc<dyn Generator>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl StageExecutor {
    pub fn new(generator: Arc<dyn Generator>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            generator,
            retry,
            call_timeout,
        }
    }

    /// One generation call with bounded retry on transient failures. An
    /// exhausted retry budget escalates to a permanent failure.
    async fn call(&self, request: GenerationRequest) -> Result<String, PipelineFailure> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.generator.generate(&request, self.call_timeout).await {
                Ok(text) => return Ok(text),
                Err(error) if error.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        stage = %request.stage,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient stage failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    let failure = PipelineFailure::from(error);
                    return Err(if failure.is_transient() {
                        failure.escalated()
                    } else {
                        failure
                    });
                }
            }
        }
    }

    /// Stage 1: infer minimal variables from the brief. A malformed response
    /// is retried once with a stricter reformatting instruction; a second
    /// malformed response is fatal.
    pub async fn infer(&self, prompt: &str) -> Result<Variables, PipelineFailure> {
        let raw = self.call(infer_request(prompt, false)).await?;
        match parse_json::<Variables>(&raw) {
            Ok(vars) => Ok(vars.normalized()),
            Err(first) => {
                warn!(error = %first, "infer response malformed, retrying with strict format");
                let raw = self.call(infer_request(prompt, true)).await?;
                parse_json::<Variables>(&raw)
                    .map(Variables::normalized)
                    .map_err(|_| first)
            }
        }
    }

    /// Stage 2: private drafting guidance.
    pub async fn guidance(&self, vars: &Variables) -> Result<Guidance, PipelineFailure> {
        let raw = self.call(guidance_request(vars)).await?;
        parse_json(&raw)
    }

    /// Stage 3: ordered outline, conditioned on the guidance. The returned
    /// list is raw; the orchestrator enforces the min/max clamp.
    pub async fn outline(
        &self,
        vars: &Variables,
        guidance: &Guidance,
        prompt: &str,
        target_words: u32,
    ) -> Result<Vec<SectionPlan>, PipelineFailure> {
        #[derive(Deserialize)]
        struct OutlinePayload {
            sections: Vec<SectionPlan>,
        }

        let raw = self
            .call(outline_request(vars, guidance, prompt, target_words))
            .await?;
        let payload: OutlinePayload = parse_json(&raw)?;
        Ok(payload.sections)
    }

    /// Stage 4: front matter and global definitions.
    pub async fn first_part(
        &self,
        vars: &Variables,
        outline: &[SectionPlan],
    ) -> Result<FirstPart, PipelineFailure> {
        let raw = self.call(first_part_request(vars, outline)).await?;
        parse_json(&raw)
    }

    /// Stage 5: draft one section as an HTML fragment.
    pub async fn draft_section(
        &self,
        index: usize,
        plan: &SectionPlan,
        ctx: &SectionContext,
    ) -> Result<String, PipelineFailure> {
        let raw = self.call(section_request(index, plan, ctx)).await?;
        let html = raw.trim();
        if html.is_empty() {
            return Err(PipelineFailure::Validation(format!(
                "empty draft for section {} '{}'",
                plan.number, plan.title
            )));
        }
        Ok(html.to_string())
    }

    /// Stage 6a: review the assembled document.
    pub async fn qc_review(
        &self,
        vars: &Variables,
        full_html: &str,
    ) -> Result<QcReview, PipelineFailure> {
        let raw = self.call(qc_review_request(vars, full_html)).await?;
        parse_json(&raw)
    }

    /// Stage 6b: one consolidated fix pass. An empty response keeps the
    /// assembled input unchanged.
    pub async fn qc_fix(
        &self,
        vars: &Variables,
        full_html: &str,
        issues: &[String],
    ) -> Result<String, PipelineFailure> {
        let raw = self.call(qc_fix_request(vars, full_html, issues)).await?;
        let fixed = raw.trim();
        if fixed.is_empty() {
            Ok(full_html.to_string())
        } else {
            Ok(fixed.to_string())
        }
    }
}

/// Parse a JSON object out of a model response, tolerating markdown fences
/// and prose around the object.
fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, PipelineFailure> {
    let trimmed = raw.trim();
    let candidate = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    };

    serde_json::from_str(candidate).map_err(|e| {
        PipelineFailure::Validation(format!("malformed stage response: {e}"))
    })
}

fn parties(vars: &Variables) -> (&str, &str) {
    let first = vars.parties.first().map(String::as_str).unwrap_or("Party A");
    let second = vars.parties.get(1).map(String::as_str).unwrap_or("Party B");
    (first, second)
}

fn infer_request(prompt: &str, strict: bool) -> GenerationRequest {
    let mut system = String::from(
        "You are a contracts lawyer. Infer minimal variables from a free-text brief.\n\
         Do not ask questions. If something is unspecified, default to GENERAL placeholders.\n\
         Return ONLY a JSON object with keys: \
         {\"title\":str,\"contract_type\":str,\"jurisdiction\":str,\"parties\":[str,str]}.\n\
         Rules:\n\
         - If the brief clearly names a contract kind (e.g. NDA, Terms of Service), preserve it; otherwise use 'Agreement'.\n\
         - Jurisdiction: use what is explicitly given; otherwise 'Applicable Law'.\n\
         - Parties: prefer role nouns when obvious (e.g. Provider/Customer), else ['Party A','Party B'].\n",
    );
    if strict {
        system.push_str(
            "Your previous answer was not valid JSON. Respond with the bare JSON object only: \
             no markdown, no commentary, no trailing text.\n",
        );
    }

    GenerationRequest {
        stage: StageKind::Infer,
        system,
        user: format!("Brief:\n{prompt}\n\nReturn ONLY the JSON."),
        temperature: 0.1,
        max_tokens: Some(400),
        json: true,
    }
}

fn guidance_request(vars: &Variables) -> GenerationRequest {
    GenerationRequest {
        stage: StageKind::Guidance,
        system: "You are a senior contracts lawyer. Produce PRIVATE drafting guidance as JSON.\n\
                 No questions. Keep guidance general; include jurisdiction considerations without \
                 naming statutes unless the brief explicitly included them.\n\
                 Return ONLY JSON: {\"html\":str,\"notes\":str}.\n\
                 'html' must be ONE <section> fragment with <h2>Guidelines</h2> and subheads \
                 (Scope, Payment, Data/Security, IP, Confidentiality, Indemnities, Liability, \
                 Disputes, Boilerplate).\n\
                 'notes' is at most 600 characters summarizing the key allocations to keep \
                 consistent across the document.\n"
            .to_string(),
        user: format!(
            "Contract Type: {}\nJurisdiction: {}\n\
             Generate neutral guidance and venue-specific considerations phrased generally.",
            vars.contract_type, vars.jurisdiction
        ),
        temperature: 0.25,
        max_tokens: Some(1_200),
        json: true,
    }
}

fn outline_request(
    vars: &Variables,
    guidance: &Guidance,
    prompt: &str,
    target_words: u32,
) -> GenerationRequest {
    GenerationRequest {
        stage: StageKind::Outline,
        system: format!(
            "You are a legal architect. Create an outline that follows the provided guidelines.\n\
             Return ONLY JSON: {{\"sections\":[{{\"number\":str,\"title\":str,\
             \"target_words\":int,\"bullets\":[str,...]}},...]}}.\n\
             Rules: 10-16 sections; neutral naming; no placeholders; no statute names; \
             centralize renewal in 'Term and Termination'; aim for roughly {target_words} words \
             per substantive section.\n"
        ),
        user: format!(
            "Contract Type: {}\nJurisdiction: {}\nGuidelines (HTML):\n{}\n\n\
             User brief (context only):\n{}\n",
            vars.contract_type, vars.jurisdiction, guidance.html, prompt
        ),
        temperature: 0.2,
        max_tokens: Some(2_000),
        json: true,
    }
}

fn first_part_request(vars: &Variables, outline: &[SectionPlan]) -> GenerationRequest {
    let (first, second) = parties(vars);
    let anticipated: String = outline
        .iter()
        .map(|s| format!("- {} {}\n", s.number, s.title))
        .collect();

    GenerationRequest {
        stage: StageKind::FirstPart,
        system: "You are a senior drafter. Return ONLY JSON {\"html\":str,\"context\":str}.\n\
                 'html' must contain two fragments: <section id='front-matter'> and \
                 <section id='global-definitions'>.\n\
                 - Keep wording GENERAL (no numeric specifics unless present in the brief).\n\
                 - No statute names unless present in the brief.\n\
                 'context' is a summary of at most 1000 characters covering defined capitalized \
                 terms and drafting constraints (renewal centralization, etc.).\n"
            .to_string(),
        user: format!(
            "Title: {}\nContract Type: {}\nJurisdiction: {}\nParties: {} and {}\n\
             Anticipated Sections:\n{}",
            vars.title, vars.contract_type, vars.jurisdiction, first, second, anticipated
        ),
        temperature: 0.2,
        max_tokens: Some(2_000),
        json: true,
    }
}

fn section_request(index: usize, plan: &SectionPlan, ctx: &SectionContext) -> GenerationRequest {
    let (first, second) = parties(&ctx.variables);
    let bullets = serde_json::to_string(&plan.bullets).unwrap_or_else(|_| "[]".to_string());

    let mut user = format!(
        "Agreement Title: {}\nContract Type: {}\nJurisdiction: {}\nParties: {} and {}\n\
         Section number: {}\nSection title: {}\nTarget words (approx): {}\n\
         Guidelines (HTML; PRIVATE; do not copy):\n{}\n\
         Opening & Definitions (HTML; authoritative; do not duplicate text):\n{}\n\
         Shared context (plain text; do not echo):\n{}\n",
        ctx.variables.title,
        ctx.variables.contract_type,
        ctx.variables.jurisdiction,
        first,
        second,
        plan.number,
        plan.title,
        plan.target_words,
        ctx.guidance_html,
        ctx.first_part_html,
        ctx.shared_context,
    );
    if !ctx.anchor_html.is_empty() {
        user.push_str(&format!(
            "Lead section (HTML; authoritative; do not duplicate its content):\n{}\n",
            ctx.anchor_html
        ));
    }
    user.push_str(&format!("Guidance bullets: {bullets}\n"));

    GenerationRequest {
        stage: StageKind::Section { index },
        system: "Draft ONE section as a valid HTML fragment.\n\
                 Start with <h2>{number} {title}</h2>. Use <p>, <ol>, <ul>, optional <h3>.\n\
                 No placeholders like [insert]. No statute names unless present in the brief.\n\
                 Keep content GENERAL (no numeric specifics) unless clearly implied by the brief.\n\
                 Centralize renewal rules in 'Term and Termination' only.\n"
            .to_string(),
        user,
        temperature: 0.35,
        max_tokens: Some(2_200),
        json: false,
    }
}

fn qc_review_request(vars: &Variables, full_html: &str) -> GenerationRequest {
    GenerationRequest {
        stage: StageKind::QcReview,
        system: "You are an expert contracts reviewer. Evaluate the HTML contract for structure, \
                 coherence, defined-terms consistency, and missing essentials.\n\
                 Return ONLY JSON {\"issues\":[str,...],\"should_fix\":bool}. Do not include the \
                 contract text.\n"
            .to_string(),
        user: format!(
            "Contract Type: {}\nJurisdiction: {}\nContract HTML to evaluate follows:\n{}",
            vars.contract_type, vars.jurisdiction, full_html
        ),
        temperature: 0.1,
        max_tokens: Some(1_800),
        json: true,
    }
}

fn qc_fix_request(vars: &Variables, full_html: &str, issues: &[String]) -> GenerationRequest {
    let issues_json = serde_json::to_string(issues).unwrap_or_else(|_| "[]".to_string());

    GenerationRequest {
        stage: StageKind::QcFix,
        system: "You are an expert contracts drafter. Fix the given HTML contract in a single \
                 pass.\n\
                 Rules: keep language GENERAL unless the brief included specifics; preserve \
                 headings and numbering; ensure renewal is centralized; avoid statute names; \
                 ensure defined-terms consistency; no placeholders; valid HTML only.\n\
                 Output ONLY the corrected HTML fragment (no JSON, no commentary).\n"
            .to_string(),
        user: format!(
            "Contract Type: {}\nJurisdiction: {}\nKnown issues: {}\n\
             Original HTML follows (fix inline):\n{}",
            vars.contract_type, vars.jurisdiction, issues_json, full_html
        ),
        temperature: 0.25,
        max_tokens: Some(8_000),
        json: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::GenerateError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyGenerator {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl Generator for FlakyGenerator {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn generate(
            &self,
            _request: &GenerationRequest,
            _timeout: Duration,
        ) -> Result<String, GenerateError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(GenerateError::Transient("rate limited".into()))
            } else {
                Ok(r#"{"title":"NDA","contract_type":"NDA","jurisdiction":"UK","parties":["Provider","Customer"]}"#.to_string())
            }
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 1.0,
        }
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10_000));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let generator = Arc::new(FlakyGenerator {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let executor =
            StageExecutor::new(generator.clone(), fast_retry(), Duration::from_secs(5));

        let vars = executor.infer("NDA between Provider and Customer").await.unwrap();
        assert_eq!(vars.contract_type, "NDA");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate() {
        let generator = Arc::new(FlakyGenerator {
            calls: AtomicU32::new(0),
            fail_first: 10,
        });
        let executor = StageExecutor::new(generator, fast_retry(), Duration::from_secs(5));

        let err = executor.infer("anything").await.unwrap_err();
        assert!(matches!(err, PipelineFailure::Permanent(_)));
    }

    #[test]
    fn test_parse_json_strips_fences() {
        let raw = "```json\n{\"html\":\"<section/>\",\"notes\":\"short\"}\n```";
        let guidance: Guidance = parse_json(raw).unwrap();
        assert_eq!(guidance.html, "<section/>");
        assert_eq!(guidance.notes, "short");
    }

    #[test]
    fn test_parse_json_tolerates_prose() {
        let raw = "Here you go:\n{\"html\":\"<p/>\"}\nLet me know!";
        let first: FirstPart = parse_json(raw).unwrap();
        assert_eq!(first.html, "<p/>");
        assert_eq!(first.context, "");
    }

    #[test]
    fn test_parse_json_failure_is_validation() {
        let err = parse_json::<Guidance>("not json at all").unwrap_err();
        assert!(matches!(err, PipelineFailure::Validation(_)));
    }

    #[test]
    fn test_qc_review_defaults_to_fix() {
        let review: QcReview = parse_json(r#"{"issues":["dup heading"]}"#).unwrap();
        assert!(review.should_fix);
        assert_eq!(review.issues.len(), 1);
    }

    #[test]
    fn test_section_request_includes_anchor_only_when_present() {
        let plan = SectionPlan {
            number: "3.".into(),
            title: "Confidentiality".into(),
            target_words: 260,
            bullets: vec!["scope".into()],
        };
        let mut ctx = SectionContext {
            variables: Variables::default(),
            guidance_html: "<section/>".into(),
            first_part_html: "<section id='front-matter'/>".into(),
            shared_context: "ctx".into(),
            anchor_html: String::new(),
        };

        let req = section_request(2, &plan, &ctx);
        assert!(!req.user.contains("Lead section"));
        assert_eq!(req.stage, StageKind::Section { index: 2 });

        ctx.anchor_html = "<h2>2. Scope</h2>".into();
        let req = section_request(2, &plan, &ctx);
        assert!(req.user.contains("Lead section"));
        assert!(req.user.contains("<h2>2. Scope</h2>"));
    }
}

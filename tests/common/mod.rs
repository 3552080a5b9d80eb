//! Shared test helpers: a scripted generator and a wired-up pipeline harness.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scrivener::adapters::{GenerateError, GenerationRequest, Generator, StageKind};
use scrivener::core::{
    EventBroker, JobRegistry, Orchestrator, PipelineSettings, RetryPolicy,
};

/// Deterministic generator that answers every stage with canned content.
/// Records the order stages were invoked in.
pub struct StubGenerator {
    calls: Mutex<Vec<StageKind>>,
    outline_len: usize,
    fail_sections: HashSet<usize>,
    review_should_fix: bool,
    stage_delay: Duration,
}

impl Default for StubGenerator {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            outline_len: 12,
            fail_sections: HashSet::new(),
            review_should_fix: false,
            stage_delay: Duration::ZERO,
        }
    }
}

impl StubGenerator {
    pub fn with_outline_len(mut self, len: usize) -> Self {
        self.outline_len = len;
        self
    }

    pub fn failing_section(mut self, index: usize) -> Self {
        self.fail_sections.insert(index);
        self
    }

    pub fn with_fix_pass(mut self) -> Self {
        self.review_should_fix = true;
        self
    }

    /// Delay every call, leaving a window for cancellation tests.
    pub fn with_stage_delay(mut self, delay: Duration) -> Self {
        self.stage_delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<StageKind> {
        self.calls.lock().unwrap().clone()
    }

    fn outline_json(&self) -> String {
        let sections: Vec<String> = (0..self.outline_len)
            .map(|i| {
                let title = if i == 0 { "Definitions".to_string() } else { format!("Clause {i}") };
                format!(
                    r#"{{"number":"{}.","title":"{title}","target_words":200,"bullets":["point one"]}}"#,
                    i + 1
                )
            })
            .collect();
        format!(r#"{{"sections":[{}]}}"#, sections.join(","))
    }
}

#[async_trait]
impl Generator for StubGenerator {
    fn name(&self) -> &str {
        "stub"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        _timeout: Duration,
    ) -> Result<String, GenerateError> {
        self.calls.lock().unwrap().push(request.stage);
        if !self.stage_delay.is_zero() {
            tokio::time::sleep(self.stage_delay).await;
        }

        match &request.stage {
            StageKind::Infer => Ok(r#"{"title":"Master Services Agreement","contract_type":"MSA","jurisdiction":"UK","parties":["Provider","Customer"]}"#.to_string()),
            StageKind::Guidance => {
                Ok(r#"{"html":"<section><h2>Guidelines</h2></section>","notes":"keep wording general"}"#.to_string())
            }
            StageKind::Outline => Ok(self.outline_json()),
            StageKind::FirstPart => Ok(
                r#"{"html":"<section id='front-matter'><h1>Master Services Agreement</h1></section>\n<section id='global-definitions'><h2>Definitions</h2></section>","context":"defined terms: Provider, Customer"}"#
                    .to_string(),
            ),
            StageKind::Section { index } => {
                if self.fail_sections.contains(index) {
                    Err(GenerateError::Permanent("model refused".to_string()))
                } else {
                    Ok(format!("<h2>{}. Section</h2><p>body {index}</p>", index + 1))
                }
            }
            StageKind::QcReview => {
                if self.review_should_fix {
                    Ok(r#"{"issues":["inconsistent defined term"],"should_fix":true}"#.to_string())
                } else {
                    Ok(r#"{"issues":[],"should_fix":false}"#.to_string())
                }
            }
            StageKind::QcFix => Ok("<article><h1>Fixed Document</h1></article>".to_string()),
        }
    }
}

pub struct Harness {
    pub registry: Arc<JobRegistry>,
    pub broker: Arc<EventBroker>,
    pub orchestrator: Arc<Orchestrator>,
    pub generator: Arc<StubGenerator>,
}

/// Wire the registry, broker, and orchestrator around a stub generator with
/// test-friendly retry delays.
pub fn harness(generator: StubGenerator) -> Harness {
    harness_with_settings(generator, PipelineSettings::default())
}

pub fn harness_with_settings(generator: StubGenerator, settings: PipelineSettings) -> Harness {
    let generator = Arc::new(generator);
    let registry = Arc::new(JobRegistry::new(Duration::from_secs(60)));
    let broker = Arc::new(EventBroker::default());
    let retry = RetryPolicy {
        max_attempts: 2,
        initial_delay_ms: 1,
        max_delay_ms: 2,
        backoff_multiplier: 1.0,
    };
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&broker),
        generator.clone(),
        retry,
        Duration::from_secs(5),
        settings,
    ));
    Harness {
        registry,
        broker,
        orchestrator,
        generator,
    }
}

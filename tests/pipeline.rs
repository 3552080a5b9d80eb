//! End-to-end pipeline tests over a scripted generator.
//!
//! Exercises the full stage order, the outline clamp, anchor-first section
//! drafting, failure escalation, and chunked delivery of the final HTML.

mod common;

use common::{harness, Harness, StubGenerator};
use scrivener::adapters::StageKind;
use scrivener::domain::{Event, EventPayload, JobStatus, ProgressMarker};
use uuid::Uuid;

async fn run_job(h: &Harness, prompt: &str) -> (Uuid, Vec<Event>) {
    let job = h.registry.create(prompt).await;
    h.broker.open(job.id).await;
    h.orchestrator.run(job.id).await;
    let events = h.broker.buffered(job.id).await.unwrap();
    (job.id, events)
}

fn chunk_concat(events: &[Event]) -> String {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::Chunk(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_happy_path_event_order() {
    let h = harness(StubGenerator::default());
    let (job_id, events) = run_job(&h, "an MSA between Provider and Customer").await;

    assert!(matches!(events[0].payload, EventPayload::Start));
    assert!(matches!(events[1].payload, EventPayload::Variables(_)));
    assert!(matches!(
        events[2].payload,
        EventPayload::Progress(ProgressMarker::GuidelinesReady)
    ));
    match &events[3].payload {
        EventPayload::Outline(outline) => assert_eq!(outline.len(), 12),
        other => panic!("expected outline, got {other:?}"),
    }
    assert!(matches!(
        events[4].payload,
        EventPayload::Progress(ProgressMarker::FirstPartReady)
    ));
    assert!(matches!(
        events[5].payload,
        EventPayload::Progress(ProgressMarker::SectionsDone)
    ));
    assert!(matches!(events.last().unwrap().payload, EventPayload::Done));

    // Sequence numbers are gapless and start at zero
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64);
        assert_eq!(event.job_id, job_id);
    }

    let chunks: usize = events
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::Chunk(_)))
        .count();
    assert!(chunks >= 1);

    let job = h.registry.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn test_final_html_assembled_in_outline_order() {
    let h = harness(StubGenerator::default());
    let (_, events) = run_job(&h, "an MSA").await;

    let html = chunk_concat(&events);
    assert!(html.starts_with("<section id='front-matter'>"));
    for i in 0..11 {
        let earlier = html.find(&format!("body {i}")).unwrap();
        let later = html.find(&format!("body {}", i + 1)).unwrap();
        assert!(earlier < later, "section {i} must precede section {}", i + 1);
    }
}

#[tokio::test]
async fn test_job_context_accumulates_stage_outputs() {
    let h = harness(StubGenerator::default());
    let (job_id, events) = run_job(&h, "an MSA between Provider and Customer").await;

    let job = h.registry.get(job_id).await.unwrap();
    let ctx = &job.context;

    assert_eq!(ctx.prompt, "an MSA between Provider and Customer");
    assert_eq!(
        ctx.variables().unwrap().title,
        "Master Services Agreement"
    );
    assert!(ctx.guidance().unwrap().html.contains("Guidelines"));
    assert_eq!(ctx.outline().unwrap().len(), 12);
    assert!(ctx.first_part().unwrap().html.contains("front-matter"));

    // Section 0 is "Definitions", so the anchor recorded first is section 1
    assert_eq!(ctx.anchor_index(), Some(1));
    assert_eq!(ctx.sections().len(), 12);
    assert!(ctx.sections()[&0].contains("body 0"));

    // The recorded final HTML is exactly what was streamed
    assert_eq!(ctx.final_html().unwrap(), chunk_concat(&events));
}

#[tokio::test]
async fn test_empty_outline_fails_without_panicking() {
    let mut settings = scrivener::core::PipelineSettings::default();
    settings.outline_min_sections = 0;
    let h = common::harness_with_settings(
        StubGenerator::default().with_outline_len(0),
        settings,
    );
    let (job_id, events) = run_job(&h, "an MSA").await;

    match &events.last().unwrap().payload {
        EventPayload::Error(message) => assert!(message.contains("no sections")),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(!h
        .generator
        .calls()
        .iter()
        .any(|stage| matches!(stage, StageKind::Section { .. })));

    let job = h.registry.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
}

#[tokio::test]
async fn test_anchor_section_drafted_before_fan_out() {
    let h = harness(StubGenerator::default());
    run_job(&h, "an MSA").await;

    let calls = h.generator.calls();
    let stages: Vec<&StageKind> = calls.iter().collect();
    assert_eq!(stages[0], &StageKind::Infer);
    assert_eq!(stages[1], &StageKind::Guidance);
    assert_eq!(stages[2], &StageKind::Outline);
    assert_eq!(stages[3], &StageKind::FirstPart);

    // Section 0 is "Definitions", so the anchor is section 1 and must be
    // the first drafting call issued
    let section_calls: Vec<usize> = calls
        .iter()
        .filter_map(|stage| match stage {
            StageKind::Section { index } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(section_calls[0], 1);
    assert_eq!(section_calls.len(), 12);

    assert_eq!(calls.last(), Some(&StageKind::QcReview));
}

#[tokio::test]
async fn test_oversized_outline_is_truncated() {
    let h = harness(StubGenerator::default().with_outline_len(20));
    let (job_id, events) = run_job(&h, "an MSA").await;

    match &events[3].payload {
        EventPayload::Outline(outline) => {
            assert_eq!(outline.len(), 16);
            assert_eq!(outline.last().unwrap().title, "Clause 15");
        }
        other => panic!("expected outline, got {other:?}"),
    }

    let max_section = h
        .generator
        .calls()
        .iter()
        .filter_map(|stage| match stage {
            StageKind::Section { index } => Some(*index),
            _ => None,
        })
        .max()
        .unwrap();
    assert_eq!(max_section, 15);

    let job = h.registry.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Done);
}

#[tokio::test]
async fn test_undersized_outline_fails_the_job() {
    let h = harness(StubGenerator::default().with_outline_len(6));
    let (job_id, events) = run_job(&h, "an MSA").await;

    match &events.last().unwrap().payload {
        EventPayload::Error(message) => assert!(message.contains("6 sections")),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(!events.iter().any(|e| matches!(e.payload, EventPayload::Done)));

    // No drafting happened
    assert!(!h
        .generator
        .calls()
        .iter()
        .any(|stage| matches!(stage, StageKind::Section { .. })));

    let job = h.registry.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
}

#[tokio::test]
async fn test_unrecoverable_section_fails_the_job() {
    let h = harness(StubGenerator::default().failing_section(5));
    let (job_id, events) = run_job(&h, "an MSA").await;

    match &events.last().unwrap().payload {
        EventPayload::Error(message) => assert!(message.contains("section")),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(!events.iter().any(|e| matches!(e.payload, EventPayload::Done)));
    assert!(!events.iter().any(|e| matches!(e.payload, EventPayload::Chunk(_))));

    let job = h.registry.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
}

#[tokio::test]
async fn test_fix_pass_replaces_assembly() {
    let h = harness(StubGenerator::default().with_fix_pass());
    let (_, events) = run_job(&h, "an MSA").await;

    assert!(matches!(events.last().unwrap().payload, EventPayload::Done));
    assert_eq!(
        chunk_concat(&events),
        "<article><h1>Fixed Document</h1></article>"
    );
    assert_eq!(h.generator.calls().last(), Some(&StageKind::QcFix));
}

#[tokio::test]
async fn test_chunk_size_is_respected() {
    let mut settings = scrivener::core::PipelineSettings::default();
    settings.chunk_chars = 40;
    let h = common::harness_with_settings(StubGenerator::default(), settings);
    let (_, events) = run_job(&h, "an MSA").await;

    let chunks: Vec<&String> = events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::Chunk(text) => Some(text),
            _ => None,
        })
        .collect();
    assert!(chunks.len() > 1);
    for chunk in &chunks {
        assert!(chunk.chars().count() <= 40);
    }
}

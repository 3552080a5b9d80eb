//! Replay-then-live subscription tests against a running pipeline.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{harness, StubGenerator};
use scrivener::domain::{Event, EventPayload};

fn assert_gapless(events: &[Event]) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64, "sequence gap at position {i}");
    }
}

#[tokio::test]
async fn test_live_subscriber_sees_full_ordered_sequence() {
    let h = harness(StubGenerator::default());
    let job = h.registry.create("an MSA").await;
    h.broker.open(job.id).await;

    let subscription = h.broker.attach(job.id).await.unwrap();
    assert!(subscription.replay.is_empty());
    let mut live = subscription.live.unwrap();

    let orchestrator = Arc::clone(&h.orchestrator);
    let job_id = job.id;
    let runner = tokio::spawn(async move { orchestrator.run(job_id).await });

    let mut received = Vec::new();
    while let Some(event) = live.recv().await {
        received.push(event);
    }
    runner.await.unwrap();

    assert_gapless(&received);
    assert!(matches!(received[0].payload, EventPayload::Start));
    assert!(matches!(received.last().unwrap().payload, EventPayload::Done));
}

#[tokio::test]
async fn test_late_subscriber_gets_full_replay_without_live_channel() {
    let h = harness(StubGenerator::default());
    let job = h.registry.create("an MSA").await;
    h.broker.open(job.id).await;
    h.orchestrator.run(job.id).await;

    let subscription = h.broker.attach(job.id).await.unwrap();
    assert!(subscription.live.is_none());
    assert_gapless(&subscription.replay);
    assert!(matches!(subscription.replay[0].payload, EventPayload::Start));
    assert!(matches!(
        subscription.replay.last().unwrap().payload,
        EventPayload::Done
    ));
}

#[tokio::test]
async fn test_mid_run_subscriber_replay_plus_live_is_complete() {
    let h = harness(StubGenerator::default().with_stage_delay(Duration::from_millis(10)));
    let job = h.registry.create("an MSA").await;
    h.broker.open(job.id).await;

    let orchestrator = Arc::clone(&h.orchestrator);
    let job_id = job.id;
    let runner = tokio::spawn(async move { orchestrator.run(job_id).await });

    // Attach somewhere in the middle of the run
    tokio::time::sleep(Duration::from_millis(25)).await;
    let subscription = h.broker.attach(job.id).await.unwrap();

    let mut combined = subscription.replay;
    if let Some(mut live) = subscription.live {
        while let Some(event) = live.recv().await {
            combined.push(event);
        }
    }
    runner.await.unwrap();

    assert_gapless(&combined);
    assert!(matches!(combined[0].payload, EventPayload::Start));
    assert!(matches!(combined.last().unwrap().payload, EventPayload::Done));

    // The full history matches what a fresh replay returns
    let full = h.broker.buffered(job.id).await.unwrap();
    assert_eq!(combined.len(), full.len());
}

#[tokio::test]
async fn test_two_subscribers_see_identical_sequences() {
    let h = harness(StubGenerator::default());
    let job = h.registry.create("an MSA").await;
    h.broker.open(job.id).await;

    let first = h.broker.attach(job.id).await.unwrap();
    let second = h.broker.attach(job.id).await.unwrap();
    let mut first_rx = first.live.unwrap();
    let mut second_rx = second.live.unwrap();

    h.orchestrator.run(job.id).await;

    let mut a = Vec::new();
    while let Some(event) = first_rx.recv().await {
        a.push(event);
    }
    let mut b = Vec::new();
    while let Some(event) = second_rx.recv().await {
        b.push(event);
    }

    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.seq, y.seq);
        assert_eq!(x.payload, y.payload);
    }
}

//! Per-job ordered event channels with replay.
//!
//! The broker keeps an append-only buffer of every event a job has published
//! plus the live subscribers currently attached. Publishing never blocks the
//! pipeline: live delivery uses `try_send` and a subscriber whose queue is
//! full (or gone) is dropped, not waited on. A subscriber attaching after the
//! terminal event still receives the complete buffer.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{Event, EventPayload};

/// Capacity of each subscriber's live queue. A subscriber this far behind a
/// pipeline that emits a few dozen events has effectively stopped reading.
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// No channel for this job (never opened, or evicted)
    #[error("no event channel for job {0}")]
    UnknownJob(Uuid),

    /// A terminal event was already published
    #[error("event channel for job {0} is closed")]
    Closed(Uuid),
}

/// Identifies one attached subscriber for idempotent detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

/// Result of attaching to a job's channel: the full buffer so far, and a live
/// receiver unless the channel already closed on a terminal event.
pub struct Subscription {
    pub replay: Vec<Event>,
    pub id: Option<SubscriberId>,
    pub live: Option<mpsc::Receiver<Event>>,
}

struct JobChannel {
    buffer: Vec<Event>,
    subscribers: Vec<(SubscriberId, mpsc::Sender<Event>)>,
    next_subscriber: u64,
    closed: bool,
}

impl JobChannel {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            subscribers: Vec::new(),
            next_subscriber: 0,
            closed: false,
        }
    }
}

/// Ordered event fan-out for all jobs in the registry.
pub struct EventBroker {
    channels: Mutex<HashMap<Uuid, JobChannel>>,
    subscriber_capacity: usize,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl EventBroker {
    pub fn new(subscriber_capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            subscriber_capacity,
        }
    }

    /// Allocate an empty channel for a new job. Idempotent.
    pub async fn open(&self, job_id: Uuid) {
        self.channels
            .lock()
            .await
            .entry(job_id)
            .or_insert_with(JobChannel::new);
    }

    /// Append an event with the next sequence number and forward it to every
    /// attached subscriber. A terminal payload closes the channel and
    /// detaches all subscribers after delivery.
    pub async fn publish(&self, job_id: Uuid, payload: EventPayload) -> Result<u64, BrokerError> {
        let mut channels = self.channels.lock().await;
        let channel = channels
            .get_mut(&job_id)
            .ok_or(BrokerError::UnknownJob(job_id))?;

        if channel.closed {
            return Err(BrokerError::Closed(job_id));
        }

        let seq = channel.buffer.len() as u64;
        let event = Event::new(job_id, seq, payload);
        let terminal = event.is_terminal();
        channel.buffer.push(event.clone());

        // Non-blocking fan-out; a full or hung-up subscriber is dropped so a
        // slow consumer can never stall the pipeline.
        channel.subscribers.retain(|(id, tx)| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(job_id = %job_id, subscriber = id.0, "subscriber backlog full, dropping");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        if terminal {
            channel.closed = true;
            channel.subscribers.clear();
            debug!(job_id = %job_id, seq, "terminal event published, channel closed");
        }

        Ok(seq)
    }

    /// Attach a subscriber: the entire existing buffer is returned for
    /// replay, followed by a live receiver for everything after it. When the
    /// channel has already closed on a terminal event the replay is complete
    /// on its own and no live receiver is handed out.
    pub async fn attach(&self, job_id: Uuid) -> Result<Subscription, BrokerError> {
        let mut channels = self.channels.lock().await;
        let channel = channels
            .get_mut(&job_id)
            .ok_or(BrokerError::UnknownJob(job_id))?;

        let replay = channel.buffer.clone();

        if channel.closed {
            return Ok(Subscription {
                replay,
                id: None,
                live: None,
            });
        }

        let id = SubscriberId(channel.next_subscriber);
        channel.next_subscriber += 1;

        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        channel.subscribers.push((id, tx));

        Ok(Subscription {
            replay,
            id: Some(id),
            live: Some(rx),
        })
    }

    /// Remove a subscriber. Safe to call for ids already dropped by the
    /// publish path or for jobs already evicted.
    pub async fn detach(&self, job_id: Uuid, subscriber: SubscriberId) {
        if let Some(channel) = self.channels.lock().await.get_mut(&job_id) {
            channel.subscribers.retain(|(id, _)| *id != subscriber);
        }
    }

    /// Drop a job's channel entirely (registry eviction).
    pub async fn remove(&self, job_id: Uuid) {
        self.channels.lock().await.remove(&job_id);
    }

    /// Snapshot of a job's buffered events.
    pub async fn buffered(&self, job_id: Uuid) -> Result<Vec<Event>, BrokerError> {
        let channels = self.channels.lock().await;
        channels
            .get(&job_id)
            .map(|c| c.buffer.clone())
            .ok_or(BrokerError::UnknownJob(job_id))
    }
}

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::dedup::ChangeSignature;
use super::engine::MirrorEngine;
use super::webhook::ResourceState;

pub const DEFAULT_RETRY_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// The change as it was first received, replayed verbatim on retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangePayload {
    pub node_id: String,
    pub state: ResourceState,
}

impl ChangePayload {
    pub fn new(node_id: impl Into<String>, state: ResourceState) -> Self {
        Self {
            node_id: node_id.into(),
            state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryRecord {
    pub signature: ChangeSignature,
    pub payload: ChangePayload,
    /// Attempts made so far, including the one that created the record.
    pub attempt: u32,
}

impl RetryRecord {
    pub fn new(signature: ChangeSignature, payload: ChangePayload) -> Self {
        Self {
            signature,
            payload,
            attempt: 1,
        }
    }

    fn next_attempt(mut self) -> Self {
        self.attempt += 1;
        self
    }
}

/// Sending half of the retry channel. Enqueueing never blocks.
#[derive(Debug, Clone)]
pub struct RetryQueue {
    tx: mpsc::Sender<RetryRecord>,
}

impl RetryQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RetryRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns `false` when the record was dropped.
    pub fn enqueue(&self, record: RetryRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                error!(
                    node = %record.payload.node_id,
                    attempt = record.attempt,
                    "retry queue full, change dropped"
                );
                false
            }
            Err(TrySendError::Closed(record)) => {
                error!(
                    node = %record.payload.node_id,
                    attempt = record.attempt,
                    "retry queue closed, change dropped"
                );
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Succeeded,
    Requeued,
    Exhausted,
    Dropped,
}

impl MirrorEngine {
    /// Replays one record through the webhook apply path, bypassing the
    /// deduplicator, and requeues it on transient failure until `max_attempts`.
    pub async fn retry_record(&self, record: RetryRecord, max_attempts: u32) -> RetryOutcome {
        if record.attempt >= max_attempts {
            error!(
                node = %record.payload.node_id,
                attempts = record.attempt,
                "change abandoned after maximum attempts"
            );
            return RetryOutcome::Exhausted;
        }

        let record = record.next_attempt();
        match self.process_payload(&record.payload).await {
            Ok(stats) => {
                info!(
                    node = %record.payload.node_id,
                    attempt = record.attempt,
                    ok = stats.ok,
                    "retried change applied"
                );
                RetryOutcome::Succeeded
            }
            Err(err) if err.is_permanent() => {
                error!(
                    node = %record.payload.node_id,
                    attempts = record.attempt,
                    error = %err,
                    "retried change cannot be applied, abandoned"
                );
                RetryOutcome::Exhausted
            }
            Err(err) if record.attempt >= max_attempts => {
                error!(
                    node = %record.payload.node_id,
                    attempts = record.attempt,
                    error = %err,
                    "change abandoned after maximum attempts"
                );
                RetryOutcome::Exhausted
            }
            Err(err) => {
                warn!(
                    node = %record.payload.node_id,
                    attempt = record.attempt,
                    error = %err,
                    "retried change failed, requeueing"
                );
                if self.retries.enqueue(record) {
                    RetryOutcome::Requeued
                } else {
                    RetryOutcome::Dropped
                }
            }
        }
    }
}

/// Consumes the retry channel until every sender is gone. Each record waits
/// out its backoff on its own task so one slow retry does not hold the queue.
pub async fn run_retry_worker(
    engine: Arc<MirrorEngine>,
    mut rx: mpsc::Receiver<RetryRecord>,
    policy: RetryPolicy,
) {
    while let Some(record) = rx.recv().await {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let delay = policy.backoff.delay(record.attempt.saturating_sub(1));
            debug!(node = %record.payload.node_id, attempt = record.attempt, ?delay, "retry scheduled");
            tokio::time::sleep(delay).await;
            engine.retry_record(record, policy.max_attempts).await;
        });
    }
    debug!("retry channel closed, worker exiting");
}

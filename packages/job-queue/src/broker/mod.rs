//! Broker: durable job storage and the claim/ack/fail state machine
//!
//! Per job: `pending -> in_flight -> {acked | retry -> pending | dead}`.
//! A claim hands out a lease token; ack, fail and release must present it,
//! so a worker whose lease expired cannot settle a job that has since been
//! handed to someone else.

mod memory;
mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{JobEnvelope, Lane};
use crate::error::QueueResult;
use crate::retry::Backoff;

pub use self::memory::InMemoryBroker;
pub use self::redis::RedisBroker;

/// A job leased to one worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub envelope: JobEnvelope,
    pub lease_token: Uuid,
    pub lease_expires_at: DateTime<Utc>,
}

impl ClaimedJob {
    pub fn id(&self) -> Uuid {
        self.envelope.id
    }
}

/// What the broker did with a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Scheduled again; `retry` is the 1-based retry number
    Retrying { retry: u32, delay: Duration },
    /// Retries exhausted (or none allowed); kept for manual inspection
    DeadLettered,
}

/// A job that will not run again without manual replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope: JobEnvelope,
    pub reason: String,
    pub died_at: DateTime<Utc>,
}

/// Point-in-time queue counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: HashMap<Lane, u64>,
    pub in_flight: u64,
    pub scheduled: u64,
    pub dead: u64,
}

impl QueueStats {
    pub fn pending_in(&self, lane: Lane) -> u64 {
        self.pending.get(&lane).copied().unwrap_or(0)
    }

    pub fn total_pending(&self) -> u64 {
        self.pending.values().sum()
    }

    /// Nothing left to run: no pending, leased or scheduled jobs
    pub fn is_drained(&self) -> bool {
        self.total_pending() == 0 && self.in_flight == 0 && self.scheduled == 0
    }
}

/// Durable queue store shared by producers and workers
#[async_trait]
pub trait Broker: Send + Sync {
    /// Durably store a new pending job
    async fn enqueue(&self, envelope: &JobEnvelope) -> QueueResult<()>;

    /// Atomically take one pending job from `lane` and lease it
    async fn claim(&self, lane: Lane, lease: Duration) -> QueueResult<Option<ClaimedJob>>;

    /// Mark a leased job as done and forget it
    async fn ack(&self, job: &ClaimedJob) -> QueueResult<()>;

    /// Record a failed attempt: schedule a retry or dead-letter the job
    async fn fail(
        &self,
        job: &ClaimedJob,
        reason: &str,
        backoff: &Backoff,
    ) -> QueueResult<FailureDisposition>;

    /// Give an unfinished job back without counting the attempt
    async fn release(&self, job: &ClaimedJob) -> QueueResult<()>;

    /// Return jobs with expired leases to pending; returns how many moved
    async fn recover_expired(&self) -> QueueResult<usize>;

    /// Move scheduled retries whose delay has passed to pending
    async fn promote_due(&self) -> QueueResult<usize>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Most recent dead letters first
    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>>;

    /// Push a dead job back to pending with a fresh retry budget
    async fn replay_dead(&self, id: Uuid) -> QueueResult<()>;

    /// Cheap liveness check against the underlying store
    async fn ping(&self) -> QueueResult<()>;

    /// Claim from the first lane in `order` that has work
    async fn claim_next(&self, order: &[Lane], lease: Duration) -> QueueResult<Option<ClaimedJob>> {
        for lane in order {
            if let Some(job) = self.claim(*lane, lease).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }
}

/// Shared retry/dead-letter decision. Returns the envelope as it should be
/// stored next.
pub(crate) fn plan_failure(
    envelope: &JobEnvelope,
    reason: &str,
    backoff: &Backoff,
) -> (JobEnvelope, FailureDisposition) {
    let mut next = envelope.clone();
    next.last_error = Some(reason.to_string());

    if envelope.can_retry() {
        next.retried += 1;
        let disposition = FailureDisposition::Retrying {
            retry: next.retried,
            delay: backoff.delay(next.retried),
        };
        (next, disposition)
    } else {
        (next, FailureDisposition::DeadLettered)
    }
}

pub(crate) fn lease_deadline(lease: Duration) -> DateTime<Utc> {
    let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(1));
    Utc::now() + lease
}

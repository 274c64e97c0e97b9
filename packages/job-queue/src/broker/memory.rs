//! In-process broker for single-instance mode and tests
//!
//! # Lock Poisoning Recovery
//!
//! Locks are taken with `unwrap_or_else(|e| e.into_inner())` so a panic while
//! holding the state lock does not wedge every other worker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{lease_deadline, plan_failure, Broker, ClaimedJob, DeadLetter, FailureDisposition, QueueStats};
use crate::envelope::{JobEnvelope, Lane};
use crate::error::{QueueError, QueueResult};
use crate::retry::Backoff;

/// Broker that keeps all state in memory
///
/// Clones share the same underlying store. Claims are atomic because every
/// state transition happens under one mutex.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    /// Envelopes of every live (pending, leased or scheduled) job
    jobs: HashMap<Uuid, JobEnvelope>,
    pending: [VecDeque<Uuid>; 3],
    leases: HashMap<Uuid, Lease>,
    scheduled: Vec<(Instant, Uuid)>,
    /// Oldest first
    dead: Vec<DeadLetter>,
}

struct Lease {
    token: Uuid,
    expires_at: Instant,
}

impl MemoryState {
    fn push_pending(&mut self, id: Uuid) {
        if let Some(lane) = self.jobs.get(&id).map(|e| e.lane) {
            self.pending[lane.index()].push_back(id);
        }
    }

    /// Drop the lease if `job` still holds it
    fn take_lease(&mut self, job: &ClaimedJob) -> QueueResult<()> {
        match self.leases.get(&job.id()) {
            Some(lease) if lease.token == job.lease_token => {
                self.leases.remove(&job.id());
                Ok(())
            }
            _ => Err(QueueError::LeaseLost(job.id())),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Envelope of a live job, as currently stored
    pub fn job(&self, id: Uuid) -> Option<JobEnvelope> {
        self.lock().jobs.get(&id).cloned()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, envelope: &JobEnvelope) -> QueueResult<()> {
        let mut state = self.lock();
        state.jobs.insert(envelope.id, envelope.clone());
        state.pending[envelope.lane.index()].push_back(envelope.id);
        Ok(())
    }

    async fn claim(&self, lane: Lane, lease: Duration) -> QueueResult<Option<ClaimedJob>> {
        let mut state = self.lock();

        while let Some(id) = state.pending[lane.index()].pop_front() {
            let Some(envelope) = state.jobs.get(&id).cloned() else {
                continue;
            };
            let token = Uuid::new_v4();
            state.leases.insert(
                id,
                Lease {
                    token,
                    expires_at: Instant::now() + lease,
                },
            );
            return Ok(Some(ClaimedJob {
                envelope,
                lease_token: token,
                lease_expires_at: lease_deadline(lease),
            }));
        }

        Ok(None)
    }

    async fn ack(&self, job: &ClaimedJob) -> QueueResult<()> {
        let mut state = self.lock();
        state.take_lease(job)?;
        state.jobs.remove(&job.id());
        Ok(())
    }

    async fn fail(
        &self,
        job: &ClaimedJob,
        reason: &str,
        backoff: &Backoff,
    ) -> QueueResult<FailureDisposition> {
        let mut state = self.lock();
        state.take_lease(job)?;

        let current = state.jobs.remove(&job.id()).unwrap_or_else(|| job.envelope.clone());
        let (next, disposition) = plan_failure(&current, reason, backoff);

        match disposition {
            FailureDisposition::Retrying { delay, .. } => {
                let id = next.id;
                state.jobs.insert(id, next);
                if delay.is_zero() {
                    state.push_pending(id);
                } else {
                    state.scheduled.push((Instant::now() + delay, id));
                }
            }
            FailureDisposition::DeadLettered => {
                state.dead.push(DeadLetter {
                    envelope: next,
                    reason: reason.to_string(),
                    died_at: Utc::now(),
                });
            }
        }

        Ok(disposition)
    }

    async fn release(&self, job: &ClaimedJob) -> QueueResult<()> {
        let mut state = self.lock();
        state.take_lease(job)?;
        if let Some(lane) = state.jobs.get(&job.id()).map(|e| e.lane) {
            state.pending[lane.index()].push_front(job.id());
        }
        Ok(())
    }

    async fn recover_expired(&self) -> QueueResult<usize> {
        let mut state = self.lock();
        let now = Instant::now();

        let expired: Vec<Uuid> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            state.leases.remove(id);
            state.push_pending(*id);
        }

        Ok(expired.len())
    }

    async fn promote_due(&self) -> QueueResult<usize> {
        let mut state = self.lock();
        let now = Instant::now();

        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.scheduled)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        state.scheduled = waiting;

        for (_, id) in &due {
            state.push_pending(*id);
        }

        Ok(due.len())
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let state = self.lock();
        let pending = Lane::ALL
            .iter()
            .map(|lane| (*lane, state.pending[lane.index()].len() as u64))
            .collect();

        Ok(QueueStats {
            pending,
            in_flight: state.leases.len() as u64,
            scheduled: state.scheduled.len() as u64,
            dead: state.dead.len() as u64,
        })
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>> {
        let state = self.lock();
        Ok(state.dead.iter().rev().take(limit).cloned().collect())
    }

    async fn replay_dead(&self, id: Uuid) -> QueueResult<()> {
        let mut state = self.lock();
        let position = state
            .dead
            .iter()
            .position(|d| d.envelope.id == id)
            .ok_or(QueueError::NotFound(id))?;

        let mut envelope = state.dead.remove(position).envelope;
        envelope.retried = 0;
        state.jobs.insert(id, envelope);
        state.push_pending(id);
        Ok(())
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::JobType;
    use assert_matches::assert_matches;
    use std::collections::HashSet;

    const LEASE: Duration = Duration::from_secs(60);

    fn envelope(job_type: JobType, max_retries: u32, lane: Lane) -> JobEnvelope {
        JobEnvelope::new(job_type, b"{}".to_vec(), max_retries, lane)
    }

    #[tokio::test]
    async fn test_claim_hides_job_from_other_workers() {
        let broker = InMemoryBroker::new();
        broker.enqueue(&envelope(JobType::Ping, 3, Lane::Default)).await.unwrap();

        let first = broker.claim(Lane::Default, LEASE).await.unwrap();
        let second = broker.claim(Lane::Default, LEASE).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(broker.stats().await.unwrap().in_flight, 1);
    }

    #[tokio::test]
    async fn test_ack_removes_job() {
        let broker = InMemoryBroker::new();
        let job = envelope(JobType::Ping, 3, Lane::Default);
        broker.enqueue(&job).await.unwrap();

        let claimed = broker.claim(Lane::Default, LEASE).await.unwrap().unwrap();
        tokio_test::assert_ok!(broker.ack(&claimed).await);

        assert!(broker.stats().await.unwrap().is_drained());
        assert!(broker.job(job.id).is_none());
    }

    #[tokio::test]
    async fn test_zero_retry_failure_goes_straight_to_dead() {
        let broker = InMemoryBroker::new();
        broker
            .enqueue(&envelope(JobType::InstallByArtist, 0, Lane::Default))
            .await
            .unwrap();

        let claimed = broker.claim(Lane::Default, LEASE).await.unwrap().unwrap();
        let disposition = broker
            .fail(&claimed, "connection refused", &Backoff::Immediate)
            .await
            .unwrap();

        assert_eq!(disposition, FailureDisposition::DeadLettered);
        let stats = broker.stats().await.unwrap();
        assert_eq!(stats.total_pending(), 0);
        assert_eq!(stats.dead, 1);

        let dead = broker.dead_letters(10).await.unwrap();
        assert_eq!(dead[0].reason, "connection refused");
        assert_eq!(dead[0].envelope.job_type, JobType::InstallByArtist);
    }

    #[tokio::test]
    async fn test_failed_job_with_budget_returns_to_pending() {
        let broker = InMemoryBroker::new();
        let job = envelope(JobType::SetSignatures, 2, Lane::Critical);
        broker.enqueue(&job).await.unwrap();

        let claimed = broker.claim(Lane::Critical, LEASE).await.unwrap().unwrap();
        let disposition = broker.fail(&claimed, "500", &Backoff::Immediate).await.unwrap();

        assert_matches!(disposition, FailureDisposition::Retrying { retry: 1, .. });
        let again = broker.claim(Lane::Critical, LEASE).await.unwrap().unwrap();
        assert_eq!(again.envelope.id, job.id);
        assert_eq!(again.envelope.retried, 1);
        assert_eq!(again.envelope.last_error.as_deref(), Some("500"));
    }

    #[tokio::test]
    async fn test_delayed_retry_waits_for_promotion() {
        let broker = InMemoryBroker::new();
        broker.enqueue(&envelope(JobType::Ping, 1, Lane::Low)).await.unwrap();

        let claimed = broker.claim(Lane::Low, LEASE).await.unwrap().unwrap();
        let backoff = Backoff::Fixed(Duration::from_millis(30));
        broker.fail(&claimed, "timeout", &backoff).await.unwrap();

        assert_eq!(broker.stats().await.unwrap().scheduled, 1);
        assert_eq!(broker.promote_due().await.unwrap(), 0);
        assert!(broker.claim(Lane::Low, LEASE).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.promote_due().await.unwrap(), 1);
        assert!(broker.claim(Lane::Low, LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_recovered() {
        let broker = InMemoryBroker::new();
        broker.enqueue(&envelope(JobType::Ping, 0, Lane::Default)).await.unwrap();

        let abandoned = broker
            .claim(Lane::Default, Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broker.recover_expired().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(broker.recover_expired().await.unwrap(), 1);

        let reclaimed = broker.claim(Lane::Default, LEASE).await.unwrap().unwrap();
        assert_eq!(reclaimed.id(), abandoned.id());
        // a crash does not count as an attempt
        assert_eq!(reclaimed.envelope.retried, 0);

        // the vanished worker cannot settle the job any more
        assert_matches!(broker.ack(&abandoned).await, Err(QueueError::LeaseLost(_)));
        broker.ack(&reclaimed).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_puts_job_at_front() {
        let broker = InMemoryBroker::new();
        let first = envelope(JobType::Ping, 0, Lane::Default);
        let second = envelope(JobType::Ping, 0, Lane::Default);
        broker.enqueue(&first).await.unwrap();
        broker.enqueue(&second).await.unwrap();

        let claimed = broker.claim(Lane::Default, LEASE).await.unwrap().unwrap();
        broker.release(&claimed).await.unwrap();

        let next = broker.claim(Lane::Default, LEASE).await.unwrap().unwrap();
        assert_eq!(next.id(), first.id);
        assert_eq!(next.envelope.retried, 0);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_share_a_job() {
        let broker = InMemoryBroker::new();
        for _ in 0..200 {
            broker.enqueue(&envelope(JobType::Ping, 0, Lane::Default)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..16 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(job) = broker.claim(Lane::Default, LEASE).await.unwrap() {
                    ids.push(job.id());
                    tokio::task::yield_now().await;
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job {} claimed twice", id);
            }
        }
        assert_eq!(seen.len(), 200);
    }

    #[tokio::test]
    async fn test_claim_next_falls_back_to_other_lanes() {
        let broker = InMemoryBroker::new();
        broker.enqueue(&envelope(JobType::Ping, 0, Lane::Low)).await.unwrap();

        let claimed = broker
            .claim_next(&[Lane::Default, Lane::Critical, Lane::Low], LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.envelope.lane, Lane::Low);
    }

    #[tokio::test]
    async fn test_replay_dead_resets_budget() {
        let broker = InMemoryBroker::new();
        let job = envelope(JobType::InstallByAlbum, 0, Lane::Default);
        broker.enqueue(&job).await.unwrap();
        let claimed = broker.claim(Lane::Default, LEASE).await.unwrap().unwrap();
        broker.fail(&claimed, "502", &Backoff::Immediate).await.unwrap();

        broker.replay_dead(job.id).await.unwrap();

        let stats = broker.stats().await.unwrap();
        assert_eq!(stats.dead, 0);
        assert_eq!(stats.pending_in(Lane::Default), 1);
        assert_matches!(
            broker.replay_dead(job.id).await,
            Err(QueueError::NotFound(_))
        );
    }
}

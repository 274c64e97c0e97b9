//! Test handlers and a broker that can be switched off
//!
//! The compute service itself is mocked with
//! `similarity_test_utils::MockComputeServer`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use similarity_job_queue::{
    Backoff, Broker, ClaimedJob, DeadLetter, FailureDisposition, InMemoryBroker, JobEnvelope,
    JobType, Lane, QueueError, QueueResult, QueueStats,
};
use similarity_worker::{DispatchTable, JobContext, JobFailure, JobHandler};
use tokio::sync::Notify;
use uuid::Uuid;

/// Records the lane of every job it runs
#[derive(Clone, Default)]
pub struct RecordingHandler {
    lanes: Arc<Mutex<Vec<Lane>>>,
}

impl RecordingHandler {
    pub fn lanes(&self) -> Vec<Lane> {
        self.lanes.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.lanes.lock().unwrap().len()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, _payload: &[u8], ctx: &JobContext) -> Result<(), JobFailure> {
        self.lanes.lock().unwrap().push(ctx.lane);
        Ok(())
    }
}

/// Counts calls and fails every one of them
#[derive(Clone, Default)]
pub struct FailingHandler {
    calls: Arc<AtomicUsize>,
}

impl FailingHandler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn handle(&self, _payload: &[u8], _ctx: &JobContext) -> Result<(), JobFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(JobFailure::transport("connection refused"))
    }
}

pub struct PanickingHandler;

#[async_trait]
impl JobHandler for PanickingHandler {
    async fn handle(&self, _payload: &[u8], _ctx: &JobContext) -> Result<(), JobFailure> {
        panic!("handler bug");
    }
}

/// Sleeps for `duration`, honouring cancellation. Signals `started` on entry.
#[derive(Clone)]
pub struct SlowHandler {
    pub duration: Duration,
    pub started: Arc<Notify>,
    pub finished: Arc<AtomicUsize>,
}

impl SlowHandler {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: Arc::new(Notify::new()),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl JobHandler for SlowHandler {
    async fn handle(&self, _payload: &[u8], ctx: &JobContext) -> Result<(), JobFailure> {
        self.started.notify_one();
        ctx.run(async {
            tokio::time::sleep(self.duration).await;
            Ok::<(), JobFailure>(())
        })
        .await?;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Table with `handler` registered for every job type
pub fn table_with<H>(handler: H) -> DispatchTable
where
    H: JobHandler + Clone + 'static,
{
    let mut table = DispatchTable::new();
    for job_type in JobType::ALL {
        table.register(job_type, handler.clone());
    }
    table
}

/// In-memory broker that fails every call while switched off, or only the
/// next few acks
#[derive(Clone, Default)]
pub struct SwitchableBroker {
    inner: InMemoryBroker,
    down: Arc<AtomicBool>,
    failing_acks: Arc<AtomicUsize>,
}

impl SwitchableBroker {
    pub fn inner(&self) -> &InMemoryBroker {
        &self.inner
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Fail the next `count` acks, then behave normally
    pub fn fail_acks(&self, count: usize) {
        self.failing_acks.store(count, Ordering::SeqCst);
    }

    pub fn ack_failures_left(&self) -> usize {
        self.failing_acks.load(Ordering::SeqCst)
    }

    fn check(&self) -> QueueResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(QueueError::Unavailable("connection reset".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for SwitchableBroker {
    async fn enqueue(&self, envelope: &JobEnvelope) -> QueueResult<()> {
        self.check()?;
        self.inner.enqueue(envelope).await
    }

    async fn claim(&self, lane: Lane, lease: Duration) -> QueueResult<Option<ClaimedJob>> {
        self.check()?;
        self.inner.claim(lane, lease).await
    }

    async fn ack(&self, job: &ClaimedJob) -> QueueResult<()> {
        self.check()?;
        let failing = self
            .failing_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(QueueError::Unavailable("connection reset".to_string()));
        }
        self.inner.ack(job).await
    }

    async fn fail(
        &self,
        job: &ClaimedJob,
        reason: &str,
        backoff: &Backoff,
    ) -> QueueResult<FailureDisposition> {
        self.check()?;
        self.inner.fail(job, reason, backoff).await
    }

    async fn release(&self, job: &ClaimedJob) -> QueueResult<()> {
        self.check()?;
        self.inner.release(job).await
    }

    async fn recover_expired(&self) -> QueueResult<usize> {
        self.check()?;
        self.inner.recover_expired().await
    }

    async fn promote_due(&self) -> QueueResult<usize> {
        self.check()?;
        self.inner.promote_due().await
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        self.check()?;
        self.inner.stats().await
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>> {
        self.check()?;
        self.inner.dead_letters(limit).await
    }

    async fn replay_dead(&self, id: Uuid) -> QueueResult<()> {
        self.check()?;
        self.inner.replay_dead(id).await
    }

    async fn ping(&self) -> QueueResult<()> {
        self.check()
    }
}

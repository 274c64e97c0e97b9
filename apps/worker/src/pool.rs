//! Worker pool: N executors pulling jobs from the broker
//!
//! Each executor loops claim -> dispatch -> report. Lane choice follows the
//! weighted scheduler shared by all executors. A janitor task returns jobs
//! with expired leases and promotes delayed retries.
//!
//! Handlers run in their own task so a panic becomes a failed attempt rather
//! than a dead executor. On shutdown, executors stop claiming, in-flight
//! handlers get `shutdown_grace` to finish, and anything still running is
//! cancelled and released back to pending without spending an attempt.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use similarity_job_queue::{
    Backoff, Broker, ClaimedJob, FailureDisposition, Lane, LaneScheduler, LaneWeights, QueueError,
    QueueResult,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::jobs::{DispatchTable, FailureKind, JobContext, JobFailure, JobOutcome};

/// Pool health as seen by operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolHealth {
    Starting,
    Healthy,
    /// Broker calls are failing; executors are paused until it answers
    BrokerUnavailable { reason: String },
    Stopped,
}

impl PoolHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Runtime knobs for the pool
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of concurrent executors
    pub concurrency: usize,
    /// Sleep between claims when every lane is empty
    pub poll_interval: Duration,
    /// Visibility timeout for a claimed job
    pub lease: Duration,
    /// How long in-flight jobs may keep running after shutdown is requested
    pub shutdown_grace: Duration,
    /// Janitor period
    pub maintenance_interval: Duration,
    /// Pause between broker pings while the broker is down
    pub broker_retry_interval: Duration,
    pub backoff: Backoff,
    pub lane_weights: LaneWeights,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(30 * 60),
            shutdown_grace: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(5),
            broker_retry_interval: Duration::from_secs(5),
            backoff: Backoff::Immediate,
            lane_weights: LaneWeights::default(),
        }
    }
}

struct PoolInner {
    broker: Arc<dyn Broker>,
    table: Arc<DispatchTable>,
    settings: PoolSettings,
    scheduler: Mutex<LaneScheduler>,
    health: watch::Sender<PoolHealth>,
}

/// Fixed-size pool of job executors
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Build a pool. Fails if any known job type has no handler or the
    /// settings cannot run a single executor.
    pub fn new(
        broker: Arc<dyn Broker>,
        table: DispatchTable,
        settings: PoolSettings,
    ) -> WorkerResult<Self> {
        table.validate()?;
        if settings.concurrency == 0 {
            return Err(WorkerError::Configuration(
                "worker concurrency must be at least 1".to_string(),
            ));
        }

        let (health, _) = watch::channel(PoolHealth::Starting);
        let scheduler = Mutex::new(LaneScheduler::new(settings.lane_weights));

        Ok(Self {
            inner: Arc::new(PoolInner {
                broker,
                table: Arc::new(table),
                settings,
                scheduler,
                health,
            }),
        })
    }

    /// Subscribe to health changes
    pub fn health(&self) -> watch::Receiver<PoolHealth> {
        self.inner.health.subscribe()
    }

    /// Run until `shutdown` is cancelled and every executor has drained
    pub async fn run(self, shutdown: CancellationToken) -> WorkerResult<()> {
        let settings = &self.inner.settings;
        info!(
            concurrency = settings.concurrency,
            lanes = %settings.lane_weights,
            lease_secs = settings.lease.as_secs(),
            "Starting worker pool"
        );

        if let Err(e) = self.inner.broker.ping().await {
            self.inner.mark_unavailable(&e);
        } else {
            self.inner.set_health(PoolHealth::Healthy);
        }

        let mut tasks = JoinSet::new();
        for worker_id in 0..settings.concurrency {
            tasks.spawn(run_executor(worker_id, self.inner.clone(), shutdown.clone()));
        }
        tasks.spawn(run_janitor(self.inner.clone(), shutdown.clone()));

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task terminated abnormally");
            }
        }

        self.inner.set_health(PoolHealth::Stopped);
        info!("Worker pool stopped");
        Ok(())
    }
}

impl PoolInner {
    fn set_health(&self, next: PoolHealth) {
        self.health.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn mark_unavailable(&self, err: &QueueError) {
        self.set_health(PoolHealth::BrokerUnavailable {
            reason: err.to_string(),
        });
    }

    fn next_lane_order(&self) -> [Lane; 3] {
        self.scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next_order()
    }

    /// Pause until the broker answers a ping. Returns false if shutdown was
    /// requested while waiting.
    async fn wait_for_broker(&self, worker_id: usize, shutdown: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.settings.broker_retry_interval) => {}
            }

            match self.broker.ping().await {
                Ok(()) => {
                    info!(worker_id, "Broker reachable again, resuming claims");
                    self.set_health(PoolHealth::Healthy);
                    return true;
                }
                Err(e) => {
                    debug!(worker_id, error = %e, "Broker still unavailable");
                    self.mark_unavailable(&e);
                }
            }
        }
    }

    /// Run one claimed job to settlement. Errors only when the broker itself
    /// failed while settling, leaving the job to lease recovery.
    async fn execute(
        &self,
        worker_id: usize,
        job: ClaimedJob,
        shutdown: &CancellationToken,
    ) -> QueueResult<()> {
        let started = Instant::now();
        let envelope = job.envelope.clone();
        let cancel = CancellationToken::new();
        let ctx = JobContext::new(&envelope, cancel.clone());

        debug!(
            worker_id,
            job_id = %envelope.id,
            job_type = %envelope.job_type,
            lane = %envelope.lane,
            attempt = ctx.attempt,
            "Claimed job"
        );

        let table = self.table.clone();
        let mut handle = tokio::spawn(async move { table.dispatch(&envelope, &ctx).await });

        let joined = tokio::select! {
            joined = &mut handle => Some(joined),
            _ = shutdown.cancelled() => {
                info!(
                    worker_id,
                    job_id = %job.id(),
                    grace_secs = self.settings.shutdown_grace.as_secs(),
                    "Shutdown requested, waiting for in-flight job"
                );
                match tokio::time::timeout(self.settings.shutdown_grace, &mut handle).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        cancel.cancel();
                        handle.abort();
                        None
                    }
                }
            }
        };

        let outcome = match joined {
            Some(Ok(outcome)) => outcome,
            Some(Err(e)) if e.is_panic() => {
                error!(worker_id, job_id = %job.id(), "Job handler panicked");
                JobOutcome::Failure(JobFailure::new(FailureKind::Panicked, "handler panicked"))
            }
            Some(Err(e)) => {
                JobOutcome::Failure(JobFailure::transport(format!("handler aborted: {}", e)))
            }
            None => return self.release(worker_id, &job).await,
        };

        self.report(worker_id, &job, outcome, started).await
    }

    async fn report(
        &self,
        worker_id: usize,
        job: &ClaimedJob,
        outcome: JobOutcome,
        started: Instant,
    ) -> QueueResult<()> {
        let envelope = &job.envelope;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            JobOutcome::Success => match self.broker.ack(job).await {
                Ok(()) => {
                    info!(
                        worker_id,
                        job_id = %envelope.id,
                        job_type = %envelope.job_type,
                        attempt = envelope.attempt(),
                        duration_ms,
                        "Job completed"
                    );
                    Ok(())
                }
                Err(e) => self.settle_error(job, "ack", e),
            },
            JobOutcome::Failure(failure) => {
                let reason = failure.to_string();
                match self.broker.fail(job, &reason, &self.settings.backoff).await {
                    Ok(FailureDisposition::Retrying { retry, delay }) => {
                        warn!(
                            worker_id,
                            job_id = %envelope.id,
                            job_type = %envelope.job_type,
                            attempt = envelope.attempt(),
                            retry,
                            max_retries = envelope.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %reason,
                            "Job failed, retry scheduled"
                        );
                        Ok(())
                    }
                    Ok(FailureDisposition::DeadLettered) => {
                        error!(
                            worker_id,
                            job_id = %envelope.id,
                            job_type = %envelope.job_type,
                            payload = %envelope.payload_preview(),
                            attempts = envelope.attempt(),
                            error = %reason,
                            "Job dead-lettered"
                        );
                        Ok(())
                    }
                    Err(e) => self.settle_error(job, "fail", e),
                }
            }
        }
    }

    async fn release(&self, worker_id: usize, job: &ClaimedJob) -> QueueResult<()> {
        match self.broker.release(job).await {
            Ok(()) => {
                info!(
                    worker_id,
                    job_id = %job.id(),
                    job_type = %job.envelope.job_type,
                    "Unfinished job released for another worker"
                );
                Ok(())
            }
            Err(e) => self.settle_error(job, "release", e),
        }
    }

    /// Log a settlement failure. Broker outages are handed back to the
    /// executor; anything else concerns this job only.
    fn settle_error(
        &self,
        job: &ClaimedJob,
        operation: &str,
        err: QueueError,
    ) -> QueueResult<()> {
        match err {
            // Lease expired mid-run; another worker now owns the job
            QueueError::LeaseLost(_) => {
                warn!(job_id = %job.id(), operation, "Lease lost before settling job");
                Ok(())
            }
            err if err.is_infrastructure() => {
                error!(
                    job_id = %job.id(),
                    operation,
                    error = %err,
                    "Could not settle job, left for lease recovery"
                );
                Err(err)
            }
            err => {
                error!(job_id = %job.id(), operation, error = %err, "Could not settle job");
                Ok(())
            }
        }
    }

    /// Mark the broker down and wait for it. Returns false on shutdown.
    async fn pause_for_broker(
        &self,
        worker_id: usize,
        err: &QueueError,
        shutdown: &CancellationToken,
    ) -> bool {
        warn!(worker_id, error = %err, "Broker unavailable, pausing claims");
        self.mark_unavailable(err);
        self.wait_for_broker(worker_id, shutdown).await
    }
}

async fn run_executor(worker_id: usize, inner: Arc<PoolInner>, shutdown: CancellationToken) {
    debug!(worker_id, "Executor started");

    while !shutdown.is_cancelled() {
        let order = inner.next_lane_order();

        match inner.broker.claim_next(&order, inner.settings.lease).await {
            Ok(Some(job)) => {
                inner.set_health(PoolHealth::Healthy);
                if let Err(e) = inner.execute(worker_id, job, &shutdown).await {
                    if !inner.pause_for_broker(worker_id, &e, &shutdown).await {
                        break;
                    }
                }
            }
            Ok(None) => {
                inner.set_health(PoolHealth::Healthy);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(inner.settings.poll_interval) => {}
                }
            }
            Err(e) if e.is_infrastructure() => {
                if !inner.pause_for_broker(worker_id, &e, &shutdown).await {
                    break;
                }
            }
            Err(e) => {
                // One bad job; the broker has already set it aside
                warn!(worker_id, error = %e, "Skipping job that could not be claimed");
            }
        }
    }

    debug!(worker_id, "Executor stopped");
}

async fn run_janitor(inner: Arc<PoolInner>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.settings.maintenance_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match inner.broker.recover_expired().await {
            Ok(0) => {}
            Ok(recovered) => warn!(recovered, "Recovered jobs with expired leases"),
            Err(e) => warn!(error = %e, "Lease recovery failed"),
        }

        match inner.broker.promote_due().await {
            Ok(0) => {}
            Ok(promoted) => debug!(promoted, "Promoted scheduled retries"),
            Err(e) => warn!(error = %e, "Retry promotion failed"),
        }
    }
}

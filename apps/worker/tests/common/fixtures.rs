//! Pool fixtures: fast settings, a running-pool harness and wait helpers

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use similarity_job_queue::{
    Broker, InMemoryBroker, JobEnvelope, JobProducer, JobType, Lane, LaneWeights, QueueStats,
    RetryPolicy,
};
use similarity_worker::{DispatchTable, PoolHealth, PoolSettings, WorkerPool};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound for any single wait in these tests
pub const WAIT: Duration = Duration::from_secs(10);

/// Settings with millisecond-scale timers
pub fn fast_settings(concurrency: usize) -> PoolSettings {
    PoolSettings {
        concurrency,
        poll_interval: Duration::from_millis(10),
        lease: Duration::from_secs(30),
        shutdown_grace: Duration::from_secs(2),
        maintenance_interval: Duration::from_millis(50),
        broker_retry_interval: Duration::from_millis(20),
        backoff: Default::default(),
        lane_weights: LaneWeights::default(),
    }
}

/// Producer over `broker` with the standard per-type retry budgets
pub fn producer(broker: Arc<dyn Broker>) -> JobProducer {
    JobProducer::new(broker, RetryPolicy::default())
}

pub fn envelope(job_type: JobType, max_retries: u32, lane: Lane) -> JobEnvelope {
    JobEnvelope::new(job_type, b"{}".to_vec(), max_retries, lane)
}

/// A pool running in the background
pub struct RunningPool {
    pub shutdown: CancellationToken,
    pub health: watch::Receiver<PoolHealth>,
    handle: JoinHandle<()>,
}

impl RunningPool {
    pub fn start(broker: Arc<dyn Broker>, table: DispatchTable, settings: PoolSettings) -> Self {
        let pool = WorkerPool::new(broker, table, settings).expect("pool should build");
        let health = pool.health();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            pool.run(token).await.expect("pool run failed");
        });

        Self {
            shutdown,
            health,
            handle,
        }
    }

    /// Request shutdown and wait for every executor to stop
    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("pool did not stop in time")
            .expect("pool task panicked");
    }

    /// Wait until the health signal satisfies `predicate`
    pub async fn wait_for_health(&mut self, predicate: impl Fn(&PoolHealth) -> bool) {
        let waited = tokio::time::timeout(WAIT, async {
            loop {
                if predicate(&*self.health.borrow_and_update()) {
                    return;
                }
                if self.health.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        assert!(
            waited.is_ok(),
            "health never matched, last seen {:?}",
            *self.health.borrow()
        );
    }
}

/// Poll `check` until it returns true or the wait bound passes
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// Wait until the broker holds no pending, leased or scheduled jobs
pub async fn wait_drained(broker: &InMemoryBroker) {
    eventually("queue to drain", || async { stats(broker).await.is_drained() }).await;
}

pub async fn stats(broker: &InMemoryBroker) -> QueueStats {
    broker.stats().await.expect("in-memory stats never fail")
}

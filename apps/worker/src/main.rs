use std::sync::Arc;

use similarity_compute_client::ComputeClient;
use similarity_job_queue::RedisBroker;
use similarity_worker::{Config, DispatchTable, PoolHealth, WorkerPool, WorkerResult};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "similarity_worker=debug,similarity_job_queue=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        environment = %config.environment(),
        compute_url = %config.compute().url,
        namespace = %config.queue.namespace,
        "Starting similarity worker"
    );

    if let Err(e) = run(config).await {
        e.log();
        return Err(e.into());
    }
    Ok(())
}

async fn run(config: Config) -> WorkerResult<()> {
    let broker = RedisBroker::connect(config.redis(), &config.queue.namespace).await?;
    let compute = ComputeClient::new(config.compute())?;

    let table = DispatchTable::with_compute_handlers(compute);
    let pool = WorkerPool::new(Arc::new(broker), table, config.pool_settings())?;

    let mut health = pool.health();
    tokio::spawn(async move {
        while health.changed().await.is_ok() {
            match &*health.borrow_and_update() {
                PoolHealth::BrokerUnavailable { reason } => {
                    tracing::error!(reason = %reason, "Worker pool unhealthy: broker unavailable")
                }
                state => tracing::info!(?state, "Worker pool health changed"),
            }
        }
    });

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    pool.run(shutdown).await
}

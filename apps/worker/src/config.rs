//! Worker configuration loaded from environment variables
//!
//! This module provides configuration management for the similarity worker.
//! Configuration is loaded from environment variables with sensible defaults for
//! development environments.

use std::time::Duration;

use anyhow::{bail, Result};
use similarity_job_queue::{Backoff, QueueConfig};
use similarity_shared_config::{parse_env, CommonConfig, ComputeConfig, Environment, RedisConfig};

use crate::pool::PoolSettings;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Common configuration shared with other services
    pub common: CommonConfig,

    /// Queue namespace, lane weights and retry budgets
    pub queue: QueueConfig,

    /// Number of concurrent executors
    pub concurrency: usize,

    /// Idle poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Lease (visibility timeout) for a claimed job in seconds
    pub lease_secs: u64,

    /// Time in-flight jobs get to finish after shutdown is requested
    pub shutdown_grace_secs: u64,

    /// Janitor period in seconds
    pub maintenance_interval_secs: u64,

    /// Pause between broker health checks while it is unreachable
    pub broker_retry_secs: u64,

    /// Delay between a failed attempt and the retry
    pub retry_backoff: Backoff,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let common = CommonConfig::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
        let queue = QueueConfig::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to load queue config: {}", e))?;

        let config = Self {
            common,
            queue,
            concurrency: parse_env("WORKER_CONCURRENCY", 10)?,
            poll_interval_ms: parse_env("WORKER_POLL_INTERVAL_MS", 500)?,
            lease_secs: parse_env("WORKER_LEASE_SECS", 1800)?,
            shutdown_grace_secs: parse_env("WORKER_SHUTDOWN_GRACE_SECS", 30)?,
            maintenance_interval_secs: parse_env("WORKER_MAINTENANCE_INTERVAL_SECS", 5)?,
            broker_retry_secs: parse_env("WORKER_BROKER_RETRY_SECS", 5)?,
            retry_backoff: parse_env("WORKER_RETRY_BACKOFF", Backoff::Immediate)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pool cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if self.maintenance_interval_secs == 0 {
            bail!("WORKER_MAINTENANCE_INTERVAL_SECS must be at least 1");
        }

        let longest_call = self.common.compute.max_timeout();
        if self.lease() <= longest_call {
            bail!(
                "WORKER_LEASE_SECS ({}s) must exceed the longest compute timeout ({}s)",
                self.lease_secs,
                longest_call.as_secs()
            );
        }

        self.common
            .compute
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid compute config: {}", e))?;
        Ok(())
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Settings for [`crate::pool::WorkerPool`]
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            concurrency: self.concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease: self.lease(),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            maintenance_interval: Duration::from_secs(self.maintenance_interval_secs),
            broker_retry_interval: Duration::from_secs(self.broker_retry_secs),
            backoff: self.retry_backoff,
            lane_weights: self.queue.lane_weights,
        }
    }

    // Convenience accessors for common config fields

    /// Get Redis configuration
    pub fn redis(&self) -> &RedisConfig {
        &self.common.redis
    }

    /// Get compute service configuration
    pub fn compute(&self) -> &ComputeConfig {
        &self.common.compute
    }

    /// Get environment mode
    pub fn environment(&self) -> Environment {
        self.common.environment
    }
}

//! Durable job queue for similarity background work
//!
//! This crate holds everything shared between the API-side producer and the
//! worker pool:
//!
//! - [`JobEnvelope`] - the stored unit of work (type tag, opaque payload,
//!   retry budget, lane)
//! - [`Broker`] - claim / ack / fail / release state machine, backed by
//!   Redis ([`RedisBroker`]) or memory ([`InMemoryBroker`])
//! - [`LaneScheduler`] - smooth weighted round-robin over the
//!   `default`, `critical` and `low` lanes
//! - [`JobProducer`] - typed enqueue calls for API handlers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use similarity_job_queue::{JobProducer, QueueConfig, RedisBroker};
//! use similarity_shared_config::RedisConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = QueueConfig::from_env()?;
//! let broker = RedisBroker::connect(&RedisConfig::from_env()?, &queue.namespace).await?;
//! let producer = JobProducer::new(Arc::new(broker), queue.retry_policy);
//!
//! // Answer "accepted" once this returns; the job runs later
//! producer.enqueue_install_by_artist("A123").await?;
//! # Ok(())
//! # }
//! ```

mod broker;
mod config;
mod envelope;
mod error;
mod lane;
mod payload;
mod producer;
mod retry;

pub use broker::{
    Broker, ClaimedJob, DeadLetter, FailureDisposition, InMemoryBroker, QueueStats, RedisBroker,
};
pub use config::QueueConfig;
pub use envelope::{JobEnvelope, JobType, Lane};
pub use error::{QueueError, QueueResult};
pub use lane::{LaneScheduler, LaneWeights};
pub use payload::{EmptyPayload, InstallByAlbumPayload, InstallByArtistPayload};
pub use producer::{EnqueueOptions, JobProducer};
pub use retry::{Backoff, RetryPolicy, DEFAULT_MAX_RETRIES};

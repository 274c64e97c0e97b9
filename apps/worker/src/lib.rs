//! Similarity worker
//!
//! Pulls jobs from the queue broker and runs them against the external
//! signature-computation service. The binary in `main.rs` wires these pieces
//! together; integration tests drive them directly with an in-memory broker.

pub mod config;
pub mod error;
pub mod jobs;
pub mod pool;

pub use config::Config;
pub use error::{ErrorSeverity, WorkerError, WorkerResult};
pub use jobs::{
    DispatchTable, FailureKind, JobContext, JobFailure, JobHandler, JobOutcome,
};
pub use pool::{PoolHealth, PoolSettings, WorkerPool};

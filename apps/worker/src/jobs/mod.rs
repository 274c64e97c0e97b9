//! Job handlers and the dispatch table
//!
//! Every job type maps to exactly one handler, registered at startup:
//! - `install_by_artist` / `install_by_album` - ask the compute service to
//!   install tracks
//! - `set_signatures` - recompute audio signatures
//! - `ping` - liveness check against the compute service

pub mod install;
pub mod ping;
pub mod signatures;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use similarity_compute_client::{ComputeClient, ComputeError};
use similarity_job_queue::{JobEnvelope, JobType, Lane};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{WorkerError, WorkerResult};

pub use install::{InstallByAlbumHandler, InstallByArtistHandler};
pub use ping::PingHandler;
pub use signatures::SetSignaturesHandler;

/// Why a job attempt failed
///
/// Retry and dead-letter decisions ignore the kind; only the job's retry
/// budget matters. The kind is for logs and operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Payload could not be decoded
    Serialization,
    /// Network error, timeout or cancellation
    Transport,
    /// Compute service answered with an unexpected status
    Status,
    /// No handler for the job type in this deployment
    UnregisteredHandler,
    /// Handler panicked
    Panicked,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Serialization => "serialization",
            Self::Transport => "transport",
            Self::Status => "status",
            Self::UnregisteredHandler => "unregistered_handler",
            Self::Panicked => "panicked",
        };
        f.write_str(name)
    }
}

/// A failed attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn serialization(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Serialization, detail)
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, detail)
    }

    pub fn unregistered(job_type: &JobType) -> Self {
        Self::new(
            FailureKind::UnregisteredHandler,
            format!("no handler registered for job type '{}'", job_type),
        )
    }
}

impl From<ComputeError> for JobFailure {
    fn from(err: ComputeError) -> Self {
        let kind = match err {
            ComputeError::Status { .. } => FailureKind::Status,
            ComputeError::JsonError(_) => FailureKind::Serialization,
            _ => FailureKind::Transport,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<serde_json::Error> for JobFailure {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Result of one handler invocation, as reported to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure(JobFailure),
}

impl From<Result<(), JobFailure>> for JobOutcome {
    fn from(result: Result<(), JobFailure>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(failure) => Self::Failure(failure),
        }
    }
}

/// Per-invocation context handed to handlers
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub lane: Lane,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_retries: u32,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(envelope: &JobEnvelope, cancel: CancellationToken) -> Self {
        Self {
            job_id: envelope.id,
            job_type: envelope.job_type.clone(),
            lane: envelope.lane,
            attempt: envelope.attempt(),
            max_retries: envelope.max_retries,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Await `fut` unless the context is cancelled first
    pub async fn run<T, E, F>(&self, fut: F) -> Result<T, JobFailure>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<JobFailure>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(JobFailure::transport("cancelled during shutdown")),
            result = fut => result.map_err(Into::into),
        }
    }
}

/// Work performed for one job type
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &[u8], ctx: &JobContext) -> Result<(), JobFailure>;
}

/// Decode a JSON payload, mapping errors to a serialization failure
pub(crate) fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, JobFailure> {
    serde_json::from_slice(payload)
        .map_err(|e| JobFailure::serialization(format!("invalid payload: {}", e)))
}

/// Jobs without arguments accept `{}` or no bytes at all
pub(crate) fn decode_empty(payload: &[u8]) -> Result<(), JobFailure> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }
    decode_payload::<similarity_job_queue::EmptyPayload>(payload).map(|_| ())
}

/// Registry mapping job types to handlers
#[derive(Default, Clone)]
pub struct DispatchTable {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the handlers for every built-in job type
    pub fn with_compute_handlers(client: ComputeClient) -> Self {
        let mut table = Self::new();
        table
            .register(JobType::InstallByArtist, InstallByArtistHandler::new(client.clone()))
            .register(JobType::InstallByAlbum, InstallByAlbumHandler::new(client.clone()))
            .register(JobType::SetSignatures, SetSignaturesHandler::new(client.clone()))
            .register(JobType::Ping, PingHandler::new(client));
        table
    }

    pub fn register<H>(&mut self, job_type: JobType, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        if self.handlers.insert(job_type.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(job_type = %job_type, "Replacing previously registered handler");
        }
        self
    }

    pub fn resolve(&self, job_type: &JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Fail fast if any known job type lacks a handler
    pub fn validate(&self) -> WorkerResult<()> {
        let missing: Vec<String> = JobType::ALL
            .iter()
            .filter(|job_type| !self.handlers.contains_key(*job_type))
            .map(|job_type| job_type.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(WorkerError::MissingHandlers(missing))
        }
    }

    /// Run the handler for `envelope`. An unregistered type is a failure
    /// like any other, so it follows the job's retry budget.
    pub async fn dispatch(&self, envelope: &JobEnvelope, ctx: &JobContext) -> JobOutcome {
        let Some(handler) = self.resolve(&envelope.job_type) else {
            tracing::error!(
                job_id = %envelope.id,
                job_type = %envelope.job_type,
                "No handler registered for job type; deployment defect"
            );
            return JobOutcome::Failure(JobFailure::unregistered(&envelope.job_type));
        };

        handler.handle(&envelope.payload, ctx).await.into()
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.handlers.keys().map(JobType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("DispatchTable").field("handlers", &types).finish()
    }
}

//! Job producer used by API-side callers
//!
//! Enqueue returns once the broker has durably stored the job, not when it
//! runs. Callers answer their own clients with "accepted" on success. Errors
//! are never retried here; the caller decides whether to try again.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::broker::Broker;
use crate::envelope::{JobEnvelope, JobType, Lane};
use crate::error::QueueResult;
use crate::payload::{EmptyPayload, InstallByAlbumPayload, InstallByArtistPayload};
use crate::retry::RetryPolicy;

/// Per-call overrides for [`JobProducer::enqueue`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Retry budget; defaults to the per-type policy
    pub max_retries: Option<u32>,
    /// Lane; defaults to [`Lane::Default`]
    pub lane: Option<Lane>,
}

impl EnqueueOptions {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn lane(mut self, lane: Lane) -> Self {
        self.lane = Some(lane);
        self
    }
}

/// Builds envelopes and hands them to the broker
#[derive(Clone)]
pub struct JobProducer {
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
}

impl JobProducer {
    pub fn new(broker: Arc<dyn Broker>, policy: RetryPolicy) -> Self {
        Self { broker, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Enqueue an opaque payload. No deduplication: every call is a new job.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: Vec<u8>,
        options: EnqueueOptions,
    ) -> QueueResult<Uuid> {
        let max_retries = options
            .max_retries
            .unwrap_or_else(|| self.policy.max_retries_for(&job_type));
        let envelope = JobEnvelope::new(job_type, payload, max_retries, options.lane.unwrap_or_default());

        if let Err(e) = self.broker.enqueue(&envelope).await {
            tracing::error!(
                job_type = %envelope.job_type,
                error = %e,
                "Failed to enqueue job"
            );
            return Err(e);
        }

        tracing::info!(
            job_id = %envelope.id,
            job_type = %envelope.job_type,
            lane = %envelope.lane,
            max_retries = envelope.max_retries,
            "Job enqueued"
        );
        Ok(envelope.id)
    }

    /// Serialize `payload` as JSON and enqueue it
    pub async fn enqueue_json<T: Serialize + ?Sized>(
        &self,
        job_type: JobType,
        payload: &T,
        options: EnqueueOptions,
    ) -> QueueResult<Uuid> {
        let bytes = serde_json::to_vec(payload)?;
        self.enqueue(job_type, bytes, options).await
    }

    pub async fn enqueue_install_by_artist(&self, artist_id: &str) -> QueueResult<Uuid> {
        let payload = InstallByArtistPayload {
            artist_id: artist_id.to_string(),
        };
        self.enqueue_json(JobType::InstallByArtist, &payload, EnqueueOptions::default())
            .await
    }

    pub async fn enqueue_install_by_album(&self, album_id: &str) -> QueueResult<Uuid> {
        let payload = InstallByAlbumPayload {
            album_id: album_id.to_string(),
        };
        self.enqueue_json(JobType::InstallByAlbum, &payload, EnqueueOptions::default())
            .await
    }

    pub async fn enqueue_set_signatures(&self) -> QueueResult<Uuid> {
        self.enqueue_json(JobType::SetSignatures, &EmptyPayload {}, EnqueueOptions::default())
            .await
    }

    pub async fn enqueue_ping(&self) -> QueueResult<Uuid> {
        self.enqueue_json(JobType::Ping, &EmptyPayload {}, EnqueueOptions::default())
            .await
    }
}

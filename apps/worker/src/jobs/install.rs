//! Track installation jobs
//!
//! Both handlers forward the id to the compute service, which downloads and
//! fingerprints the tracks. These jobs are enqueued with no retry budget, so
//! a failure here dead-letters the job.

use async_trait::async_trait;
use similarity_compute_client::ComputeClient;
use similarity_job_queue::{InstallByAlbumPayload, InstallByArtistPayload};
use tracing::{info, instrument};

use super::{decode_payload, JobContext, JobFailure, JobHandler};

pub struct InstallByArtistHandler {
    client: ComputeClient,
}

impl InstallByArtistHandler {
    pub fn new(client: ComputeClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobHandler for InstallByArtistHandler {
    #[instrument(skip_all, fields(job_id = %ctx.job_id, attempt = ctx.attempt))]
    async fn handle(&self, payload: &[u8], ctx: &JobContext) -> Result<(), JobFailure> {
        let input: InstallByArtistPayload = decode_payload(payload)?;
        info!(artist_id = %input.artist_id, "Installing tracks for artist");

        let response = ctx.run(self.client.install_artist(&input.artist_id)).await?;

        info!(
            artist_id = %input.artist_id,
            status = response.status,
            "Artist install accepted"
        );
        Ok(())
    }
}

pub struct InstallByAlbumHandler {
    client: ComputeClient,
}

impl InstallByAlbumHandler {
    pub fn new(client: ComputeClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobHandler for InstallByAlbumHandler {
    #[instrument(skip_all, fields(job_id = %ctx.job_id, attempt = ctx.attempt))]
    async fn handle(&self, payload: &[u8], ctx: &JobContext) -> Result<(), JobFailure> {
        let input: InstallByAlbumPayload = decode_payload(payload)?;
        info!(album_id = %input.album_id, "Installing tracks for album");

        let response = ctx.run(self.client.install_album(&input.album_id)).await?;

        info!(
            album_id = %input.album_id,
            status = response.status,
            "Album install accepted"
        );
        Ok(())
    }
}

//! Signature recomputation job

use async_trait::async_trait;
use similarity_compute_client::ComputeClient;
use tracing::{info, instrument};

use super::{decode_empty, JobContext, JobFailure, JobHandler};

/// Asks the compute service to rebuild audio signatures for the library.
/// Long-running on the service side; the call timeout is sized for it.
pub struct SetSignaturesHandler {
    client: ComputeClient,
}

impl SetSignaturesHandler {
    pub fn new(client: ComputeClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobHandler for SetSignaturesHandler {
    #[instrument(skip_all, fields(job_id = %ctx.job_id, attempt = ctx.attempt))]
    async fn handle(&self, payload: &[u8], ctx: &JobContext) -> Result<(), JobFailure> {
        decode_empty(payload)?;
        info!(
            timeout_secs = self.client.config().signatures_timeout_secs,
            "Requesting signature recomputation"
        );

        ctx.run(self.client.set_signatures()).await?;

        info!("Signatures updated");
        Ok(())
    }
}

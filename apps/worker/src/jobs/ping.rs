//! Compute service liveness job

use async_trait::async_trait;
use similarity_compute_client::ComputeClient;
use tracing::{info, instrument};

use super::{decode_empty, JobContext, JobFailure, JobHandler};

/// Liveness check: calls the compute service and logs what it answered
pub struct PingHandler {
    client: ComputeClient,
}

impl PingHandler {
    pub fn new(client: ComputeClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobHandler for PingHandler {
    #[instrument(skip_all, fields(job_id = %ctx.job_id, attempt = ctx.attempt))]
    async fn handle(&self, payload: &[u8], ctx: &JobContext) -> Result<(), JobFailure> {
        decode_empty(payload)?;

        let response = ctx.run(self.client.ping()).await?;

        info!(body = %response.body.trim(), "Compute service ping response");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similarity_job_queue::{JobEnvelope, JobType, Lane};
    use similarity_test_utils::MockComputeServer;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_ping_logs_body() {
        let server = MockComputeServer::start().await;
        server.mock_ping(200, "pong from compute").await;
        let handler = PingHandler::new(ComputeClient::new(&server.config()).unwrap());
        let envelope = JobEnvelope::new(JobType::Ping, b"{}".to_vec(), 0, Lane::Default);

        let result = handler
            .handle(&envelope.payload, &JobContext::new(&envelope, CancellationToken::new()))
            .await;

        assert!(result.is_ok());
        assert!(logs_contain("pong from compute"));
        assert!(logs_contain(&format!("job_id={}", envelope.id)));
        assert!(logs_contain("attempt=1"));
    }
}

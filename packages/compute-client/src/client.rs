//! HTTP client for the signature-computation service
//!
//! One call per method, no client-side retry: retry policy belongs to the job
//! layer. Each call carries its own timeout sized to the operation.

use std::time::Duration;

use reqwest::{Client, Method};
use serde_json::json;
use similarity_shared_config::ComputeConfig;
use tracing::debug;

use crate::error::{ComputeError, ComputeResult};

/// Maximum error body size kept in errors and logs
const MAX_ERROR_BODY_SIZE: usize = 1000;

/// Response from the compute service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeResponse {
    pub status: u16,
    pub body: String,
}

impl ComputeResponse {
    /// Turn a 2xx response outside `accepted` into a status error
    pub fn expect_status(self, accepted: &[u16]) -> ComputeResult<Self> {
        if accepted.contains(&self.status) {
            Ok(self)
        } else {
            Err(ComputeError::Status {
                status: self.status,
                body: truncate_error_body(self.body),
            })
        }
    }
}

/// Compute service client with a shared connection pool
///
/// `Clone + Send + Sync`; clones share the same pool.
#[derive(Debug, Clone)]
pub struct ComputeClient {
    http_client: Client,
    config: ComputeConfig,
}

impl ComputeClient {
    /// Create a new client from configuration
    ///
    /// The underlying client has no overall timeout; every call sets its own.
    pub fn new(config: &ComputeConfig) -> ComputeResult<Self> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(ComputeError::HttpError)?;

        Ok(Self {
            http_client,
            config: config.clone(),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    /// Perform one request. Any non-2xx status is an error.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        timeout: Duration,
    ) -> ComputeResult<ComputeResponse> {
        let url = self.config.endpoint(path);
        debug!(%method, %url, timeout_secs = timeout.as_secs(), "Calling compute service");

        let mut request = self.http_client.request(method, &url).timeout(timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| self.classify(e, timeout))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.classify(e, timeout))?;

        if !status.is_success() {
            return Err(ComputeError::Status {
                status: status.as_u16(),
                body: truncate_error_body(text),
            });
        }

        Ok(ComputeResponse {
            status: status.as_u16(),
            body: text,
        })
    }

    /// Ask the service to download and fingerprint an artist's tracks
    pub async fn install_artist(&self, artist_id: &str) -> ComputeResult<ComputeResponse> {
        let body = json!({ "artist_id": artist_id });
        self.call(
            Method::POST,
            "/install/artist",
            Some(&body),
            self.config.install_timeout(),
        )
        .await?
        .expect_status(&[200, 202])
    }

    /// Ask the service to download and fingerprint an album's tracks
    pub async fn install_album(&self, album_id: &str) -> ComputeResult<ComputeResponse> {
        let body = json!({ "album_id": album_id });
        self.call(
            Method::POST,
            "/install/album",
            Some(&body),
            self.config.install_timeout(),
        )
        .await?
        .expect_status(&[200, 202])
    }

    /// Recompute audio signatures for the whole library
    pub async fn set_signatures(&self) -> ComputeResult<ComputeResponse> {
        self.call(
            Method::POST,
            "/signatures/set",
            None,
            self.config.signatures_timeout(),
        )
        .await?
        .expect_status(&[200])
    }

    /// Liveness check
    pub async fn ping(&self) -> ComputeResult<ComputeResponse> {
        self.call(Method::GET, "/ping", None, self.config.ping_timeout())
            .await?
            .expect_status(&[200])
    }

    fn classify(&self, err: reqwest::Error, timeout: Duration) -> ComputeError {
        if err.is_timeout() {
            ComputeError::Timeout(timeout.as_secs())
        } else if err.is_connect() {
            ComputeError::ConnectionRefused(self.config.url.clone())
        } else {
            ComputeError::HttpError(err)
        }
    }
}

/// Truncate error body to prevent memory exhaustion
/// Safely handles UTF-8 boundaries to avoid panics on multi-byte characters
fn truncate_error_body(body: String) -> String {
    if body.len() <= MAX_ERROR_BODY_SIZE {
        return body;
    }

    let truncate_at = body
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|i| *i <= MAX_ERROR_BODY_SIZE)
        .last()
        .unwrap_or(0);

    format!("{}... (truncated)", &body[..truncate_at])
}

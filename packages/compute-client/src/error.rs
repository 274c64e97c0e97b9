//! Error types for the compute client

use thiserror::Error;

/// Errors that can occur when calling the compute service
#[derive(Error, Debug)]
pub enum ComputeError {
    /// Request could not be built or sent
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Failed to serialize the request body
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Service answered with a status outside the accepted set
    #[error("compute service returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// No answer within the per-call timeout
    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    /// Connection refused (service not running)
    #[error("connection refused. Is the compute service running at {0}?")]
    ConnectionRefused(String),
}

impl ComputeError {
    /// Whether the service answered at all. Status errors carry a response;
    /// everything else failed at the transport level.
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Status { .. })
    }
}

/// Result type for compute operations
pub type ComputeResult<T> = Result<T, ComputeError>;

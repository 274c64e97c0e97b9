//! Error types for the job queue

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the producer and the broker
#[derive(Error, Debug)]
pub enum QueueError {
    /// Payload or envelope could not be serialized. Caller error, never retried.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis command or connection failed
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Broker could not be reached or refused the operation
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// A stored envelope could not be decoded
    #[error("corrupt envelope for job {id}: {reason}")]
    CorruptEnvelope { id: String, reason: String },

    /// The caller's lease expired and the job was handed to someone else
    #[error("lease lost for job {0}")]
    LeaseLost(Uuid),

    /// No job with this id in the requested state
    #[error("job not found: {0}")]
    NotFound(Uuid),

    /// Invalid queue configuration
    #[error("invalid queue configuration: {0}")]
    Configuration(String),
}

impl QueueError {
    /// Whether this error means the broker itself is unhealthy, as opposed to
    /// a problem with one particular job.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Redis(_) | Self::Unavailable(_))
    }

    pub fn corrupt(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptEnvelope {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

impl From<similarity_shared_config::ConfigError> for QueueError {
    fn from(err: similarity_shared_config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_errors() {
        assert!(QueueError::Unavailable("down".to_string()).is_infrastructure());
        assert!(!QueueError::LeaseLost(Uuid::new_v4()).is_infrastructure());
        assert!(!QueueError::corrupt("abc", "bad json").is_infrastructure());
    }

    #[test]
    fn test_error_display() {
        let err = QueueError::corrupt("abc", "missing field `lane`");
        assert_eq!(
            err.to_string(),
            "corrupt envelope for job abc: missing field `lane`"
        );
    }
}

//! Error handling for the similarity worker
//!
//! Job attempts fail with [`crate::jobs::JobFailure`], which the pool hands to
//! the broker. [`WorkerError`] covers everything around them: startup,
//! configuration and broker plumbing.

use similarity_compute_client::ComputeError;
use similarity_job_queue::QueueError;
use thiserror::Error;

/// Main worker error type
#[derive(Error, Debug)]
pub enum WorkerError {
    // ========== Queue Errors ==========
    /// Broker operation failed
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    // ========== Compute Service Errors ==========
    /// Compute client could not be built or called
    #[error("compute service error: {0}")]
    Compute(#[from] ComputeError),

    // ========== Dispatch Errors ==========
    /// Known job types with no registered handler
    #[error("no handler registered for job types: {}", .0.join(", "))]
    MissingHandlers(Vec<String>),

    // ========== Configuration Errors ==========
    /// Pool settings that cannot run
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl WorkerError {
    /// Get a severity level for logging
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            // Deployment defects: the pool refuses to start
            Self::Configuration(_) | Self::MissingHandlers(_) => ErrorSeverity::Critical,

            Self::Queue(err) if err.is_infrastructure() => ErrorSeverity::Error,

            Self::Compute(_) => ErrorSeverity::Warning,

            _ => ErrorSeverity::Info,
        }
    }

    /// Log the error with appropriate severity
    pub fn log(&self) {
        match self.severity() {
            ErrorSeverity::Critical => tracing::error!(error = %self, "Critical worker error"),
            ErrorSeverity::Error => tracing::error!(error = %self, "Worker error"),
            ErrorSeverity::Warning => tracing::warn!(error = %self, "Worker warning"),
            ErrorSeverity::Info => tracing::info!(error = %self, "Worker info"),
        }
    }
}

/// Error severity levels for logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that should trigger alerts
    Critical,
    /// Standard errors
    Error,
    /// Warnings for expected failures
    Warning,
    /// Informational messages
    Info,
}

/// Result type alias for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_levels() {
        assert_eq!(
            WorkerError::Configuration("test".to_string()).severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(
            WorkerError::MissingHandlers(vec!["ping".to_string()]).severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(
            WorkerError::Queue(QueueError::Unavailable("down".to_string())).severity(),
            ErrorSeverity::Error
        );
        assert_eq!(
            WorkerError::Queue(QueueError::LeaseLost(uuid::Uuid::nil())).severity(),
            ErrorSeverity::Info
        );
        assert_eq!(
            WorkerError::Compute(ComputeError::Timeout(10)).severity(),
            ErrorSeverity::Warning
        );
    }

    #[test]
    fn test_error_display() {
        let err = WorkerError::MissingHandlers(vec!["ping".to_string(), "set_signatures".to_string()]);
        assert_eq!(
            err.to_string(),
            "no handler registered for job types: ping, set_signatures"
        );
    }

    #[test]
    fn test_startup_failures_convert() {
        let err: WorkerError = QueueError::Unavailable("refused".to_string()).into();
        assert!(matches!(err, WorkerError::Queue(_)));

        let err: WorkerError =
            ComputeError::ConnectionRefused("http://compute:5000".to_string()).into();
        assert!(matches!(err, WorkerError::Compute(_)));
        assert!(err.to_string().starts_with("compute service error"));
    }
}

//! Configuration errors

use thiserror::Error;

/// An environment variable held a value the services cannot use
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Value failed to parse or is out of range
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    /// Value is not a parseable URL
    #[error("invalid URL format for {0}: {1}")]
    InvalidUrl(String, String),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

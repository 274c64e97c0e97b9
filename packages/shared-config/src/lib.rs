//! Shared configuration types for similarity services
//!
//! This crate provides common configuration types used by both the API-side
//! job producer and the worker service, ensuring consistency across the
//! application.

mod compute;
mod error;
mod redis;

pub use compute::ComputeConfig;
pub use error::{ConfigError, ConfigResult};
pub use redis::RedisConfig;

use std::env;

/// Common configuration shared between all services
#[derive(Debug, Clone)]
pub struct CommonConfig {
    /// Redis configuration (queue broker)
    pub redis: RedisConfig,

    /// External compute service configuration
    pub compute: ComputeConfig,

    /// Environment mode (development, staging, production)
    pub environment: Environment,
}

/// Application environment mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl std::str::FromStr for Environment {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "staging" | "stage" => Self::Staging,
            _ => Self::Development,
        })
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl CommonConfig {
    /// Load common configuration from environment variables
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            redis: RedisConfig::from_env()?,
            compute: ComputeConfig::from_env()?,
            environment: env::var("ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string())
                .parse()
                .unwrap_or_default(),
        })
    }
}

/// Helper function to get an optional environment variable with a default
pub fn get_env_or_default(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Helper function to parse an environment variable into a specific type
pub fn parse_env<T>(name: &str, default: T) -> ConfigResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

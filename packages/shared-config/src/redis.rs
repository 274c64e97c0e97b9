//! Redis configuration types

use crate::{parse_env, ConfigResult};

/// Redis configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Optional password for Redis authentication
    pub password: Option<String>,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl RedisConfig {
    /// Load Redis configuration from environment variables
    ///
    /// `REDIS_ADDR` may hold a bare `host:port`, in which case the scheme is added.
    pub fn from_env() -> ConfigResult<Self> {
        let url = std::env::var("REDIS_URL")
            .or_else(|_| std::env::var("REDIS_ADDR"))
            .map(|raw| normalize_url(&raw))
            .unwrap_or_else(|_| "redis://localhost:6379".to_string());

        Ok(Self {
            url,
            password: std::env::var("REDIS_PASSWORD").ok().filter(|s| !s.is_empty()),
            connect_timeout_secs: parse_env("REDIS_CONNECT_TIMEOUT", 5)?,
        })
    }

    /// Create a configuration with a custom URL (useful for testing)
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            password: None,
            connect_timeout_secs: 5,
        }
    }

    /// Build the full connection URL including password if set
    pub fn connection_url(&self) -> String {
        if let Some(ref password) = self.password {
            if let Some(at_pos) = self.url.find("://") {
                let (scheme, rest) = self.url.split_at(at_pos + 3);
                return format!("{}:{}@{}", scheme, password, rest);
            }
        }
        self.url.clone()
    }
}

fn normalize_url(raw: &str) -> String {
    if raw.contains("://") {
        raw.to_string()
    } else {
        format!("redis://{}", raw)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            password: None,
            connect_timeout_secs: 5,
        }
    }
}

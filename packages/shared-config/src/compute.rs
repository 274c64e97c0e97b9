//! External compute service configuration types

use std::time::Duration;

use crate::{parse_env, ConfigError, ConfigResult};

/// Configuration for the external signature-computation service
#[derive(Debug, Clone)]
pub struct ComputeConfig {
    /// Base URL of the compute service (e.g., http://audio-processing:5000)
    pub url: String,

    /// Timeout for install operations in seconds
    pub install_timeout_secs: u64,

    /// Timeout for signature computation in seconds
    pub signatures_timeout_secs: u64,

    /// Timeout for the liveness check in seconds
    pub ping_timeout_secs: u64,

    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl ComputeConfig {
    /// Load compute service configuration from environment variables
    ///
    /// `COMPUTE_SERVICE_URL` wins over the legacy `PYTHON_APP_URL`.
    pub fn from_env() -> ConfigResult<Self> {
        let url = std::env::var("COMPUTE_SERVICE_URL")
            .or_else(|_| std::env::var("PYTHON_APP_URL"))
            .unwrap_or_else(|_| "http://localhost:5000".to_string());

        let config = Self {
            url,
            install_timeout_secs: parse_env("COMPUTE_INSTALL_TIMEOUT", 120)?,
            signatures_timeout_secs: parse_env("COMPUTE_SIGNATURES_TIMEOUT", 300)?,
            ping_timeout_secs: parse_env("COMPUTE_PING_TIMEOUT", 10)?,
            connect_timeout_secs: parse_env("COMPUTE_CONNECT_TIMEOUT", 10)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration with a custom URL (useful for testing)
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Reject values that would make every outbound call fail immediately
    pub fn validate(&self) -> ConfigResult<()> {
        if url::Url::parse(&self.url).is_err() {
            return Err(ConfigError::InvalidUrl(
                "COMPUTE_SERVICE_URL".to_string(),
                self.url.clone(),
            ));
        }
        for (name, value) in [
            ("COMPUTE_INSTALL_TIMEOUT", self.install_timeout_secs),
            ("COMPUTE_SIGNATURES_TIMEOUT", self.signatures_timeout_secs),
            ("COMPUTE_PING_TIMEOUT", self.ping_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    "timeout must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Join a path onto the base URL
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn signatures_timeout(&self) -> Duration {
        Duration::from_secs(self.signatures_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    /// Longest outbound timeout, used to size claim leases
    pub fn max_timeout(&self) -> Duration {
        self.install_timeout()
            .max(self.signatures_timeout())
            .max(self.ping_timeout())
    }
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5000".to_string(),
            install_timeout_secs: 120,
            signatures_timeout_secs: 300,
            ping_timeout_secs: 10,
            connect_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ComputeConfig::default();
        assert_eq!(config.url, "http://localhost:5000");
        assert_eq!(config.install_timeout(), Duration::from_secs(120));
        assert_eq!(config.ping_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_install_outlasts_ping() {
        let config = ComputeConfig::default();
        assert!(config.install_timeout() > config.ping_timeout());
        assert_eq!(config.max_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_endpoint_urls() {
        let config = ComputeConfig::with_url("http://compute:5000/");
        assert_eq!(config.endpoint("/install/artist"), "http://compute:5000/install/artist");
        assert_eq!(config.endpoint("ping"), "http://compute:5000/ping");
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let config = ComputeConfig::with_url("not a url");
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl(_, _))));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = ComputeConfig {
            ping_timeout_secs: 0,
            ..ComputeConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_, _))));
    }

    #[test]
    fn test_from_env_prefers_compute_service_url() {
        temp_env::with_vars(
            [
                ("COMPUTE_SERVICE_URL", Some("http://compute:9000")),
                ("PYTHON_APP_URL", Some("http://legacy:5000")),
                ("COMPUTE_INSTALL_TIMEOUT", Some("600")),
            ],
            || {
                let config = ComputeConfig::from_env().unwrap();
                assert_eq!(config.url, "http://compute:9000");
                assert_eq!(config.install_timeout_secs, 600);
            },
        );
    }

    #[test]
    fn test_from_env_falls_back_to_legacy_url() {
        temp_env::with_vars(
            [
                ("COMPUTE_SERVICE_URL", None),
                ("PYTHON_APP_URL", Some("http://legacy:5000")),
            ],
            || {
                let config = ComputeConfig::from_env().unwrap();
                assert_eq!(config.url, "http://legacy:5000");
            },
        );
    }
}

//! Retry policy: per-type retry budgets and the backoff delay function

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::envelope::JobType;
use crate::error::QueueError;

/// Broker-wide default retry budget when neither the caller nor the per-type
/// policy sets one
pub const DEFAULT_MAX_RETRIES: u32 = 25;

/// Delay before a failed job becomes claimable again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Re-enqueue straight away
    #[default]
    Immediate,
    /// Same delay after every failure
    Fixed(Duration),
    /// `base * 2^(retry - 1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Self::Immediate => Duration::ZERO,
            Self::Fixed(delay) => delay,
            Self::Exponential { base, max } => {
                let exponent = retry.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exponent)
                    .map_or(max, |delay| delay.min(max))
            }
        }
    }
}

/// Parses `immediate`, `fixed:<secs>` or `exponential:<base_secs>:<max_secs>`
impl FromStr for Backoff {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || QueueError::Configuration(format!("invalid backoff '{}'", s));
        let secs = |v: &str| v.trim().parse::<u64>().map(Duration::from_secs).map_err(|_| invalid());

        let parts: Vec<&str> = s.trim().split(':').collect();
        match parts.as_slice() {
            ["immediate"] => Ok(Self::Immediate),
            ["fixed", delay] => Ok(Self::Fixed(secs(delay)?)),
            ["exponential", base, max] => Ok(Self::Exponential {
                base: secs(base)?,
                max: secs(max)?,
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::Fixed(delay) => write!(f, "fixed:{}", delay.as_secs()),
            Self::Exponential { base, max } => {
                write!(f, "exponential:{}:{}", base.as_secs(), max.as_secs())
            }
        }
    }
}

/// Retry budgets per job type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    default_max_retries: u32,
    overrides: HashMap<JobType, u32>,
}

impl RetryPolicy {
    /// Policy with no per-type overrides
    pub fn uniform(default_max_retries: u32) -> Self {
        Self {
            default_max_retries,
            overrides: HashMap::new(),
        }
    }

    /// Install jobs are not known to be idempotent on the compute side, so
    /// they never run twice.
    pub fn standard(default_max_retries: u32) -> Self {
        Self::uniform(default_max_retries)
            .with_override(JobType::InstallByArtist, 0)
            .with_override(JobType::InstallByAlbum, 0)
    }

    pub fn with_override(mut self, job_type: JobType, max_retries: u32) -> Self {
        self.overrides.insert(job_type, max_retries);
        self
    }

    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    pub fn max_retries_for(&self, job_type: &JobType) -> u32 {
        self.overrides
            .get(job_type)
            .copied()
            .unwrap_or(self.default_max_retries)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard(DEFAULT_MAX_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_is_default() {
        assert_eq!(Backoff::default(), Backoff::Immediate);
        assert_eq!(Backoff::Immediate.delay(5), Duration::ZERO);
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(5), Duration::from_secs(32));
        assert_eq!(backoff.delay(6), Duration::from_secs(60));
        assert_eq!(backoff.delay(40), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_backoff() {
        assert_eq!("immediate".parse::<Backoff>().unwrap(), Backoff::Immediate);
        assert_eq!(
            "fixed:5".parse::<Backoff>().unwrap(),
            Backoff::Fixed(Duration::from_secs(5))
        );
        let parsed: Backoff = "exponential:1:300".parse().unwrap();
        assert_eq!(parsed.to_string(), "exponential:1:300");
        assert!("fixed".parse::<Backoff>().is_err());
        assert!("linear:3".parse::<Backoff>().is_err());
    }

    #[test]
    fn test_standard_policy_pins_installs_to_zero() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries_for(&JobType::InstallByArtist), 0);
        assert_eq!(policy.max_retries_for(&JobType::InstallByAlbum), 0);
        assert_eq!(policy.max_retries_for(&JobType::SetSignatures), DEFAULT_MAX_RETRIES);
        assert_eq!(policy.max_retries_for(&JobType::Ping), DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_override_wins() {
        let policy = RetryPolicy::standard(3).with_override(JobType::Ping, 1);
        assert_eq!(policy.max_retries_for(&JobType::Ping), 1);
        assert_eq!(policy.max_retries_for(&JobType::SetSignatures), 3);
    }
}

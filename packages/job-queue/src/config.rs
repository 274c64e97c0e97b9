//! Queue configuration loaded from environment variables

use similarity_shared_config::{get_env_or_default, parse_env};

use crate::envelope::JobType;
use crate::error::QueueResult;
use crate::lane::LaneWeights;
use crate::retry::{RetryPolicy, DEFAULT_MAX_RETRIES};

/// Settings shared by producers and workers
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Prefix for every broker key
    pub namespace: String,

    /// Relative lane weights
    pub lane_weights: LaneWeights,

    /// Retry budgets per job type
    pub retry_policy: RetryPolicy,
}

impl QueueConfig {
    /// Load queue configuration from environment variables
    ///
    /// Per-type budgets come from `QUEUE_RETRIES_<TYPE>`, e.g.
    /// `QUEUE_RETRIES_SET_SIGNATURES=3`. Install jobs default to zero.
    pub fn from_env() -> QueueResult<Self> {
        let default_max_retries = parse_env("QUEUE_DEFAULT_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        let mut retry_policy = RetryPolicy::standard(default_max_retries);

        for job_type in JobType::ALL {
            let name = format!("QUEUE_RETRIES_{}", job_type.env_suffix());
            if std::env::var(&name).is_ok() {
                let max_retries: u32 = parse_env(&name, 0)?;
                retry_policy = retry_policy.with_override(job_type, max_retries);
            }
        }

        Ok(Self {
            namespace: get_env_or_default("QUEUE_NAMESPACE", "similarity"),
            lane_weights: get_env_or_default("QUEUE_LANE_WEIGHTS", "default=6,critical=3,low=1")
                .parse()?,
            retry_policy,
        })
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: "similarity".to_string(),
            lane_weights: LaneWeights::default(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the worker pool, sweeper and gateway.
///
/// The HTTP layer builds this from environment variables; tests construct
/// it directly. Call [`PipelineConfig::validate`] before starting anything.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root for `jobs.db`, `inputs/`, `outputs/` and `work/`.
    pub storage_root: PathBuf,
    /// Number of concurrent executors (default: `2`).
    pub max_workers: usize,
    /// Ceiling on one tool invocation (default: 300s).
    pub per_job_timeout: Duration,
    /// Retries allowed after the first attempt (default: `3`).
    pub max_retries: i32,
    /// How long a lease stays valid without renewal (default: 60s).
    pub lease_duration: Duration,
    /// Sweeper period; must be shorter than `lease_duration` (default: 15s).
    pub sweep_interval: Duration,
    /// Pending backlog that, with every worker busy, rejects submissions (default: `64`).
    pub max_queue_depth: i64,
    /// Largest accepted upload in bytes (default: 100 MiB).
    pub max_upload_bytes: usize,
    /// First executor back-off delay after an empty poll (default: 200ms).
    pub poll_interval_min: Duration,
    /// Back-off ceiling (default: 5s).
    pub poll_interval_max: Duration,
    /// Prefix for generated worker ids.
    pub worker_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./data"),
            max_workers: 2,
            per_job_timeout: Duration::from_secs(300),
            max_retries: 3,
            lease_duration: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(15),
            max_queue_depth: 64,
            max_upload_bytes: 100 * 1024 * 1024,
            poll_interval_min: Duration::from_millis(200),
            poll_interval_max: Duration::from_secs(5),
            worker_prefix: "audionorm".to_string(),
        }
    }
}

/// Rejected pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("max_retries must not be negative")]
    NegativeRetries,

    #[error(
        "sweep interval ({sweep_ms}ms) must be shorter than the lease duration ({lease_ms}ms)"
    )]
    SweepNotShorterThanLease { sweep_ms: u128, lease_ms: u128 },

    #[error("poll_interval_min must not exceed poll_interval_max")]
    PollRange,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::NotPositive("max_workers"));
        }
        if self.per_job_timeout.is_zero() {
            return Err(ConfigError::NotPositive("per_job_timeout"));
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::NotPositive("lease_duration"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::NotPositive("sweep_interval"));
        }
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::NotPositive("max_upload_bytes"));
        }
        if self.poll_interval_min.is_zero() {
            return Err(ConfigError::NotPositive("poll_interval_min"));
        }
        if self.max_retries < 0 {
            return Err(ConfigError::NegativeRetries);
        }
        if self.sweep_interval >= self.lease_duration {
            return Err(ConfigError::SweepNotShorterThanLease {
                sweep_ms: self.sweep_interval.as_millis(),
                lease_ms: self.lease_duration.as_millis(),
            });
        }
        if self.poll_interval_min > self.poll_interval_max {
            return Err(ConfigError::PollRange);
        }
        Ok(())
    }

    /// How often a running executor renews its lease.
    pub fn lease_renewal_interval(&self) -> Duration {
        (self.lease_duration / 3).max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(PipelineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn sweep_must_be_shorter_than_lease() {
        let config = PipelineConfig {
            lease_duration: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::SweepNotShorterThanLease {
                sweep_ms: 10_000,
                lease_ms: 10_000
            })
        );
    }

    #[test]
    fn zero_workers_rejected() {
        let config = PipelineConfig {
            max_workers: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NotPositive("max_workers")));
    }

    #[test]
    fn inverted_poll_range_rejected() {
        let config = PipelineConfig {
            poll_interval_min: Duration::from_secs(10),
            poll_interval_max: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PollRange));
    }

    #[test]
    fn renewal_is_a_third_of_the_lease() {
        let config = PipelineConfig::default();
        assert_eq!(config.lease_renewal_interval(), Duration::from_secs(20));
    }
}

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use audionorm_core::ffmpeg::NormalizeSettings;
use audionorm_pipeline::config::ConfigError as PipelineConfigError;
use audionorm_pipeline::PipelineConfig;

/// Log output format selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Rejected server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error(transparent)]
    Pipeline(#[from] PipelineConfigError),
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    pub log_format: LogFormat,
    /// Normalization tool program (default: `ffmpeg` on `PATH`).
    pub ffmpeg_path: PathBuf,
    pub normalize: NormalizeSettings,
    pub pipeline: PipelineConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                 |
    /// |------------------------|-------------------------|
    /// | `HOST`                 | `0.0.0.0`               |
    /// | `PORT`                 | `8000`                  |
    /// | `CORS_ORIGINS`         | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                    |
    /// | `LOG_FORMAT`           | `text`                  |
    /// | `STORAGE_PATH`         | `./data`                |
    /// | `MAX_WORKERS`          | `2`                     |
    /// | `PER_JOB_TIMEOUT_SECS` | `300`                   |
    /// | `MAX_RETRIES`          | `3`                     |
    /// | `LEASE_DURATION_SECS`  | `60`                    |
    /// | `SWEEP_INTERVAL_SECS`  | `15`                    |
    /// | `MAX_QUEUE_DEPTH`      | `64`                    |
    /// | `MAX_UPLOAD_BYTES`     | `104857600`             |
    /// | `POLL_INTERVAL_MIN_MS` | `200`                   |
    /// | `POLL_INTERVAL_MAX_MS` | `5000`                  |
    /// | `FFMPEG_PATH`          | `ffmpeg`                |
    /// | `TARGET_LUFS`          | `-14`                   |
    /// | `TRUE_PEAK_DB`         | `-1.0`                  |
    /// | `LOUDNESS_RANGE`       | `11`                    |
    /// | `OUTPUT_SAMPLE_RATE`   | `48000`                 |
    /// | `OUTPUT_BITRATE`       | `320k`                  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };
        let pipeline_defaults = PipelineConfig::default();
        let normalize_defaults = NormalizeSettings::default();

        let cors_origins = env
            .string("CORS_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let pipeline = PipelineConfig {
            storage_root: PathBuf::from(env.string("STORAGE_PATH", "./data")),
            max_workers: env.parse("MAX_WORKERS", pipeline_defaults.max_workers)?,
            per_job_timeout: Duration::from_secs(env.parse("PER_JOB_TIMEOUT_SECS", 300)?),
            max_retries: env.parse("MAX_RETRIES", pipeline_defaults.max_retries)?,
            lease_duration: Duration::from_secs(env.parse("LEASE_DURATION_SECS", 60)?),
            sweep_interval: Duration::from_secs(env.parse("SWEEP_INTERVAL_SECS", 15)?),
            max_queue_depth: env.parse("MAX_QUEUE_DEPTH", pipeline_defaults.max_queue_depth)?,
            max_upload_bytes: env.parse("MAX_UPLOAD_BYTES", pipeline_defaults.max_upload_bytes)?,
            poll_interval_min: Duration::from_millis(env.parse("POLL_INTERVAL_MIN_MS", 200)?),
            poll_interval_max: Duration::from_millis(env.parse("POLL_INTERVAL_MAX_MS", 5000)?),
            worker_prefix: pipeline_defaults.worker_prefix,
        };
        pipeline.validate()?;

        let normalize = NormalizeSettings {
            target_lufs: env.parse("TARGET_LUFS", normalize_defaults.target_lufs)?,
            true_peak_db: env.parse("TRUE_PEAK_DB", normalize_defaults.true_peak_db)?,
            loudness_range: env.parse("LOUDNESS_RANGE", normalize_defaults.loudness_range)?,
            sample_rate: env.parse("OUTPUT_SAMPLE_RATE", normalize_defaults.sample_rate)?,
            bitrate: env.string("OUTPUT_BITRATE", &normalize_defaults.bitrate),
        };

        Ok(Self {
            host: env.string("HOST", "0.0.0.0"),
            port: env.parse("PORT", 8000)?,
            cors_origins,
            request_timeout_secs: env.parse("REQUEST_TIMEOUT_SECS", 30)?,
            log_format: env.parse("LOG_FORMAT", LogFormat::default())?,
            ffmpeg_path: PathBuf::from(env.string("FFMPEG_PATH", "ffmpeg")),
            normalize,
            pipeline,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str, default: &str) -> String {
        (self.lookup)(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match (self.lookup)(name) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = from_vars(&[]).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.cors_origins, vec!["http://localhost:5173"]);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.pipeline.max_workers, 2);
        assert_eq!(config.pipeline.lease_duration, Duration::from_secs(60));
        assert_eq!(config.pipeline.max_upload_bytes, 104_857_600);
        assert_eq!(config.normalize.target_lufs, -14.0);
        assert_eq!(config.normalize.bitrate, "320k");
    }

    #[test]
    fn overrides_are_parsed() {
        let config = from_vars(&[
            ("PORT", "9100"),
            ("MAX_WORKERS", "4"),
            ("LOG_FORMAT", "json"),
            ("CORS_ORIGINS", "http://a.test, http://b.test"),
            ("TARGET_LUFS", "-16"),
        ])
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.pipeline.max_workers, 4);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
        assert_eq!(config.normalize.target_lufs, -16.0);
    }

    #[test]
    fn malformed_value_is_reported_by_name() {
        assert_matches!(
            from_vars(&[("MAX_WORKERS", "many")]),
            Err(ConfigError::Invalid { name: "MAX_WORKERS", .. })
        );
    }

    #[test]
    fn sweep_not_shorter_than_lease_is_rejected() {
        assert_matches!(
            from_vars(&[("LEASE_DURATION_SECS", "10"), ("SWEEP_INTERVAL_SECS", "10")]),
            Err(ConfigError::Pipeline(PipelineConfigError::SweepNotShorterThanLease { .. }))
        );
    }
}

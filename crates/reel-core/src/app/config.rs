//! Scheduler configuration, loaded from TOML.
//!
//! Every key is optional; missing keys take the defaults below. Durations are
//! integer seconds (`*_secs`).
//!
//! ```toml
//! [loops]
//! assign_interval_secs = 5
//! assign_batch_limit = 32
//! expiry_interval_secs = 300
//! retry_interval_secs = 60
//! assignment_timeout_secs = 1800
//! estimated_duration_factor = 2.0
//! store_timeout_secs = 5
//! notify_timeout_secs = 2
//! shutdown_grace_secs = 30
//!
//! [workers]
//! heartbeat_interval_secs = 30
//! missed_heartbeats = 3
//!
//! [tasks]
//! default_priority = 5
//! default_max_retries = 3
//!
//! [backoff]
//! base_delay_secs = 30
//! multiplier = 2.0
//! max_delay_secs = 600
//! ```

use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::task::{MAX_PRIORITY, MIN_PRIORITY};
use crate::domain::{RetryPolicy, SchedulerError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for SchedulerError {
    fn from(err: ConfigError) -> Self {
        SchedulerError::Config(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub loops: LoopSection,
    pub workers: WorkerSection,
    pub tasks: TaskSection,
    pub backoff: BackoffSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoopSection {
    pub assign_interval_secs: u64,
    pub assign_batch_limit: usize,
    pub expiry_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub assignment_timeout_secs: u64,
    /// Assignment timeout for a task = max(assignment_timeout, estimate * factor).
    pub estimated_duration_factor: f64,
    pub store_timeout_secs: u64,
    pub notify_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for LoopSection {
    fn default() -> Self {
        Self {
            assign_interval_secs: 5,
            assign_batch_limit: 32,
            expiry_interval_secs: 300,
            retry_interval_secs: 60,
            assignment_timeout_secs: 1800,
            estimated_duration_factor: 2.0,
            store_timeout_secs: 5,
            notify_timeout_secs: 2,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub heartbeat_interval_secs: u64,
    /// Consecutive missed heartbeats before a worker counts as offline.
    pub missed_heartbeats: u32,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            missed_heartbeats: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TaskSection {
    pub default_priority: u8,
    pub default_max_retries: u32,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            default_priority: 5,
            default_max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    pub base_delay_secs: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_delay_secs: 30,
            multiplier: 2.0,
            max_delay_secs: 600,
        }
    }
}

impl SchedulerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            source,
            path: PathBuf::from("<inline>"),
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            source,
            path: path.to_path_buf(),
        })
    }

    /// Rejects zero intervals/limits and out-of-range defaults.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("loops.assign_interval_secs", self.loops.assign_interval_secs),
            ("loops.assign_batch_limit", self.loops.assign_batch_limit as u64),
            ("loops.expiry_interval_secs", self.loops.expiry_interval_secs),
            ("loops.retry_interval_secs", self.loops.retry_interval_secs),
            ("loops.assignment_timeout_secs", self.loops.assignment_timeout_secs),
            ("loops.store_timeout_secs", self.loops.store_timeout_secs),
            ("loops.notify_timeout_secs", self.loops.notify_timeout_secs),
            ("workers.heartbeat_interval_secs", self.workers.heartbeat_interval_secs),
            ("workers.missed_heartbeats", u64::from(self.workers.missed_heartbeats)),
            ("backoff.base_delay_secs", self.backoff.base_delay_secs),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
        }

        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.tasks.default_priority) {
            return Err(ConfigError::Invalid(format!(
                "tasks.default_priority must be within {MIN_PRIORITY}..={MAX_PRIORITY}"
            )));
        }
        if !self.loops.estimated_duration_factor.is_finite()
            || self.loops.estimated_duration_factor <= 0.0
        {
            return Err(ConfigError::Invalid(
                "loops.estimated_duration_factor must be a positive number".into(),
            ));
        }
        if !self.backoff.multiplier.is_finite() || self.backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "backoff.multiplier must be at least 1.0".into(),
            ));
        }
        if self.backoff.max_delay_secs < self.backoff.base_delay_secs {
            return Err(ConfigError::Invalid(
                "backoff.max_delay_secs must not be below backoff.base_delay_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn assign_interval(&self) -> Duration {
        Duration::from_secs(self.loops.assign_interval_secs)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.loops.expiry_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.loops.retry_interval_secs)
    }

    pub fn assignment_timeout(&self) -> Duration {
        Duration::from_secs(self.loops.assignment_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.loops.store_timeout_secs)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.loops.notify_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.loops.shutdown_grace_secs)
    }

    /// heartbeat interval x missed heartbeats (90s by default).
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(
            self.workers
                .heartbeat_interval_secs
                .saturating_mul(u64::from(self.workers.missed_heartbeats)),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(self.backoff.base_delay_secs),
            multiplier: self.backoff.multiplier,
            max_delay: Duration::from_secs(self.backoff.max_delay_secs),
        }
    }

    /// Per-task assignment timeout, stretched for long jobs.
    pub fn timeout_for(&self, estimated: Option<Duration>) -> Duration {
        let base = self.assignment_timeout();
        match estimated {
            Some(estimate) => {
                let scaled = estimate.as_secs_f64() * self.loops.estimated_duration_factor;
                if scaled.is_finite() && scaled > base.as_secs_f64() {
                    Duration::try_from_secs_f64(scaled).unwrap_or(Duration::MAX)
                } else {
                    base
                }
            }
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.assign_interval(), Duration::from_secs(5));
        assert_eq!(config.expiry_interval(), Duration::from_secs(300));
        assert_eq!(config.retry_interval(), Duration::from_secs(60));
        assert_eq!(config.liveness_window(), Duration::from_secs(90));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
        assert_eq!(config.tasks.default_priority, 5);
        assert_eq!(config.tasks.default_max_retries, 3);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = SchedulerConfig::from_toml_str(
            r#"
            [loops]
            assign_interval_secs = 1

            [backoff]
            multiplier = 3.0
            "#,
        )
        .unwrap();

        assert_eq!(config.assign_interval(), Duration::from_secs(1));
        assert_eq!(config.loops.assign_batch_limit, 32);
        assert_eq!(config.backoff.multiplier, 3.0);
        assert_eq!(config.backoff.base_delay_secs, 30);
        assert_eq!(config.workers, WorkerSection::default());
    }

    #[test]
    fn empty_toml_is_the_default_config() {
        let config = SchedulerConfig::from_toml_str("").unwrap();
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = SchedulerConfig::from_toml_str("[loops\nassign_interval_secs = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = SchedulerConfig::load("/definitely/not/here/reel.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn validate_rejects_zero_and_out_of_range_values() {
        let mut config = SchedulerConfig::default();
        config.loops.assign_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.tasks.default_priority = 11;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.backoff.max_delay_secs = 1;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.workers.missed_heartbeats = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn timeout_stretches_for_long_jobs() {
        let config = SchedulerConfig::default();
        assert_eq!(config.timeout_for(None), Duration::from_secs(1800));
        assert_eq!(
            config.timeout_for(Some(Duration::from_secs(60))),
            Duration::from_secs(1800)
        );
        assert_eq!(
            config.timeout_for(Some(Duration::from_secs(3600))),
            Duration::from_secs(7200)
        );
    }
}

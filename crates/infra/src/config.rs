//! Configuration loading and representation.
//!
//! Every knob has a default matching production behaviour; environment
//! variables prefixed `CAMWATCH_JOBS_` override them.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const ENV_PREFIX: &str = "CAMWATCH_JOBS_";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Tunables for the job registry, timeout policy store and timeout checker.
#[derive(Debug, Clone, PartialEq)]
pub struct JobsConfig {
    /// TTL applied to a job's metadata once it reaches a terminal state.
    pub completed_job_ttl: Duration,
    /// Maximum number of ids kept in the time-ordered job index.
    pub status_list_max_entries: u64,
    /// Active-registry entries older than this are considered orphaned.
    pub stale_active_threshold: Duration,
    /// TTL of per-job timeout configuration (outlives the retry chain).
    pub timeout_config_ttl: Duration,
    /// TTL of per-job attempt counters.
    pub attempt_counter_ttl: Duration,
    /// Timeout used for job types missing from `default_timeouts`.
    pub default_timeout: Duration,
    /// Per-job-type default timeouts.
    pub default_timeouts: HashMap<String, Duration>,
    pub default_max_retry_attempts: u32,
    /// Interval between two timeout-check cycles.
    pub check_interval: Duration,
    /// How long `stop()` waits for an in-flight cycle before aborting it.
    pub shutdown_grace: Duration,
    /// Page size used when a cycle reads the active registry.
    pub scan_batch_size: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            completed_job_ttl: Duration::from_secs(3600),
            status_list_max_entries: 10_000,
            stale_active_threshold: Duration::from_secs(7200),
            timeout_config_ttl: Duration::from_secs(48 * 3600),
            attempt_counter_ttl: Duration::from_secs(3600),
            default_timeout: Duration::from_secs(600),
            default_timeouts: default_timeouts(),
            default_max_retry_attempts: 3,
            check_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            scan_batch_size: 1000,
        }
    }
}

fn default_timeouts() -> HashMap<String, Duration> {
    [
        ("ai_analysis", 300),
        ("export", 1800),
        ("cleanup", 600),
        ("retention", 3600),
        ("backup", 7200),
    ]
    .into_iter()
    .map(|(job_type, secs)| (job_type.to_string(), Duration::from_secs(secs)))
    .collect()
}

impl JobsConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary lookup (e.g. a map in tests).
    ///
    /// Keys are looked up with the [`ENV_PREFIX`] prepended.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("COMPLETED_TTL_SECS") {
            config.completed_job_ttl = parse_secs("COMPLETED_TTL_SECS", &v)?;
        }
        if let Some(v) = get("STATUS_LIST_MAX_ENTRIES") {
            config.status_list_max_entries = parse("STATUS_LIST_MAX_ENTRIES", &v)?;
        }
        if let Some(v) = get("STALE_ACTIVE_SECS") {
            config.stale_active_threshold = parse_secs("STALE_ACTIVE_SECS", &v)?;
        }
        if let Some(v) = get("TIMEOUT_CONFIG_TTL_SECS") {
            config.timeout_config_ttl = parse_secs("TIMEOUT_CONFIG_TTL_SECS", &v)?;
        }
        if let Some(v) = get("ATTEMPTS_TTL_SECS") {
            config.attempt_counter_ttl = parse_secs("ATTEMPTS_TTL_SECS", &v)?;
        }
        if let Some(v) = get("DEFAULT_TIMEOUT_SECS") {
            config.default_timeout = parse_secs("DEFAULT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("DEFAULT_MAX_RETRY_ATTEMPTS") {
            config.default_max_retry_attempts = parse("DEFAULT_MAX_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("CHECK_INTERVAL_SECS") {
            config.check_interval = parse_secs("CHECK_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("SHUTDOWN_GRACE_SECS") {
            config.shutdown_grace = parse_secs("SHUTDOWN_GRACE_SECS", &v)?;
        }
        if let Some(v) = get("SCAN_BATCH_SIZE") {
            config.scan_batch_size = parse("SCAN_BATCH_SIZE", &v)?;
        }

        if config.check_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: format!("{ENV_PREFIX}CHECK_INTERVAL_SECS"),
                value: "0".to_string(),
                reason: "interval must be positive".to_string(),
            });
        }

        Ok(config)
    }

    /// Default timeout for a job type, falling back to the global default.
    pub fn default_timeout_for(&self, job_type: &str) -> Duration {
        self.default_timeouts
            .get(job_type)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_status_list_max_entries(mut self, max: u64) -> Self {
        self.status_list_max_entries = max;
        self
    }
}

fn parse<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{name}"),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_secs(name: &str, raw: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(name, raw).map(Duration::from_secs)
}

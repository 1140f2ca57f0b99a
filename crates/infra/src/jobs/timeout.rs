//! Timeout policy store and timeout detector.
//!
//! ## Storage
//!
//! - `job:{id}:timeout`: JSON [`TimeoutConfig`], long TTL so the policy
//!   outlives the (short-TTL) failed job and its whole retry chain
//! - `job:{id}:attempts`: `{"count": n}`, how many times the logical job has
//!   been retried after timing out
//!
//! ## Retry semantics
//!
//! A timed-out job is always marked failed. If attempts remain, a fresh
//! pending job is registered with `{retry_of, attempt, original_extra}`
//! metadata; the timeout policy and attempt counter are carried over to it.
//!
//! Detection and handling are separate store round-trips, so two concurrent
//! scanners can both handle the same job (double increment, two successors).
//! Delivery is at-least-once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, instrument, warn};

use camwatch_core::{Clock, JobId};

use crate::config::JobsConfig;
use crate::kv_store::KvStore;

use super::error::JobError;
use super::keys;
use super::status::JobStatusService;
use super::types::{JobMetadata, JobStatus, TimeoutConfig, TimeoutResult};

/// Which limit a job ran past.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutReason {
    /// `timeout_seconds` elapsed since the job started.
    Elapsed { seconds: u64 },
    /// The absolute deadline passed.
    Deadline(DateTime<Utc>),
    /// No limits configured; the job-type default elapsed.
    Default { seconds: u64 },
}

impl TimeoutReason {
    pub fn message(&self) -> String {
        match self {
            TimeoutReason::Elapsed { seconds } => {
                format!("Job timed out after {seconds} seconds")
            }
            TimeoutReason::Deadline(deadline) => {
                format!("Job timed out: deadline {} exceeded", deadline.to_rfc3339())
            }
            TimeoutReason::Default { seconds } => {
                format!("Job timed out after default timeout of {seconds} seconds")
            }
        }
    }
}

pub struct JobTimeoutService<S> {
    registry: Arc<JobStatusService<S>>,
    clock: Arc<dyn Clock>,
    config: JobsConfig,
}

impl<S> std::fmt::Debug for JobTimeoutService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTimeoutService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: KvStore> JobTimeoutService<S> {
    pub fn new(
        registry: Arc<JobStatusService<S>>,
        clock: Arc<dyn Clock>,
        config: &JobsConfig,
    ) -> Self {
        Self {
            registry,
            clock,
            config: config.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<JobStatusService<S>> {
        &self.registry
    }

    fn store(&self) -> &S {
        self.registry.store()
    }

    // -- policy store ------------------------------------------------------

    pub async fn set_timeout_config(
        &self,
        job_id: &JobId,
        config: &TimeoutConfig,
    ) -> Result<(), JobError> {
        self.store()
            .set(
                &keys::job_timeout(job_id),
                &config.to_value(),
                Some(self.config.timeout_config_ttl),
            )
            .await?;
        Ok(())
    }

    pub async fn get_timeout_config(
        &self,
        job_id: &JobId,
    ) -> Result<Option<TimeoutConfig>, JobError> {
        let Some(raw) = self.store().get(&keys::job_timeout(job_id)).await? else {
            return Ok(None);
        };
        match TimeoutConfig::from_value(raw) {
            Ok(config) => Ok(Some(config)),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "ignoring unreadable timeout config");
                Ok(None)
            }
        }
    }

    /// Current attempt count, 0 when none is stored.
    ///
    /// Accepts the canonical `{"count": n}` shape as well as a bare number or
    /// numeric string written by older deployments.
    pub async fn get_attempt_count(&self, job_id: &JobId) -> Result<u32, JobError> {
        let raw = self.store().get(&keys::job_attempts(job_id)).await?;
        Ok(raw.map_or(0, |value| parse_attempt_count(job_id, &value)))
    }

    /// Bump the attempt counter and refresh its TTL; returns the new count.
    pub async fn increment_attempt_count(&self, job_id: &JobId) -> Result<u32, JobError> {
        let next = self.get_attempt_count(job_id).await?.saturating_add(1);
        self.set_attempt_count(job_id, next).await?;
        Ok(next)
    }

    pub async fn set_attempt_count(&self, job_id: &JobId, count: u32) -> Result<(), JobError> {
        self.store()
            .set(
                &keys::job_attempts(job_id),
                &json!({ "count": count }),
                Some(self.config.attempt_counter_ttl),
            )
            .await?;
        Ok(())
    }

    pub fn get_default_timeout(&self, job_type: &str) -> Duration {
        self.config.default_timeout_for(job_type)
    }

    /// Forget the timeout policy and attempt counter of a job.
    pub async fn cleanup_timeout_data(&self, job_id: &JobId) -> Result<(), JobError> {
        self.store().delete(&keys::job_timeout(job_id)).await?;
        self.store().delete(&keys::job_attempts(job_id)).await?;
        debug!(job_id = %job_id, "timeout data removed");
        Ok(())
    }

    // -- detection ---------------------------------------------------------

    /// Whether a running job has exceeded its allotted time.
    ///
    /// Only running jobs with a start time can time out. `config` is fetched
    /// from the store when not supplied. Boundaries are inclusive.
    pub async fn is_job_timed_out(
        &self,
        job: &JobMetadata,
        config: Option<&TimeoutConfig>,
    ) -> Result<bool, JobError> {
        if job.status != JobStatus::Running || job.started_at.is_none() {
            return Ok(false);
        }

        let fetched;
        let config = match config {
            Some(c) => Some(c),
            None => {
                fetched = self.get_timeout_config(&job.job_id).await?;
                fetched.as_ref()
            }
        };

        Ok(self.timeout_reason(job, config, self.clock.now()).is_some())
    }

    /// Fail a timed-out job and, if attempts remain, register its successor.
    #[instrument(skip(self, job), fields(job_id = %job.job_id, job_type = %job.job_type), err)]
    pub async fn handle_timeout(&self, job: &JobMetadata) -> Result<TimeoutResult, JobError> {
        let config = self.get_timeout_config(&job.job_id).await?;
        let max_attempts = config
            .as_ref()
            .map_or(self.config.default_max_retry_attempts, |c| c.max_retry_attempts);

        let reason = self
            .timeout_reason(job, config.as_ref(), self.clock.now())
            .unwrap_or_else(|| self.configured_reason(job, config.as_ref()));
        let error_message = reason.message();

        let attempts = self.attempts_so_far(job).await?;

        self.registry.fail_job(&job.job_id, &error_message).await?;

        if attempts.saturating_add(1) < max_attempts {
            let new_count = attempts + 1;
            self.set_attempt_count(&job.job_id, new_count).await?;
            let metadata = json!({
                "retry_of": job.job_id,
                "attempt": new_count + 1,
                "original_extra": job.extra.clone().unwrap_or(JsonValue::Null),
            });
            let new_job_id = self
                .registry
                .start_job(None, &job.job_type, Some(metadata))
                .await?;

            if let Some(config) = &config {
                self.set_timeout_config(&new_job_id, config).await?;
            }
            self.set_attempt_count(&new_job_id, new_count).await?;

            info!(
                job_id = %job.job_id,
                new_job_id = %new_job_id,
                attempt = new_count + 1,
                max_attempts,
                "timed-out job rescheduled"
            );

            return Ok(TimeoutResult {
                job_id: job.job_id.clone(),
                job_type: job.job_type.clone(),
                was_rescheduled: true,
                attempt_count: new_count,
                max_attempts,
                error_message,
                new_job_id: Some(new_job_id),
            });
        }

        warn!(
            job_id = %job.job_id,
            attempts = attempts + 1,
            max_attempts,
            "timed-out job exhausted its retries"
        );

        Ok(TimeoutResult {
            job_id: job.job_id.clone(),
            job_type: job.job_type.clone(),
            was_rescheduled: false,
            attempt_count: attempts.saturating_add(1),
            max_attempts,
            error_message,
            new_job_id: None,
        })
    }

    /// Scan active jobs and handle every one that has timed out.
    ///
    /// A failure on one job is logged and skipped; only failing to read the
    /// active registry itself aborts the scan.
    pub async fn check_for_timeouts(&self) -> Result<Vec<TimeoutResult>, JobError> {
        let job_ids = self
            .registry
            .get_all_active_job_ids(self.config.scan_batch_size)
            .await?;
        let mut results = Vec::new();

        for job_id in &job_ids {
            match self.check_job(job_id).await {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "timeout check failed for job");
                }
            }
        }

        if !results.is_empty() {
            info!(
                scanned = job_ids.len(),
                timed_out = results.len(),
                "timeout scan handled jobs"
            );
        }
        Ok(results)
    }

    /// Attempt count of `job`. When the counter has expired (long-running job
    /// types outlive its TTL) the successor's own `attempt` metadata is used.
    async fn attempts_so_far(&self, job: &JobMetadata) -> Result<u32, JobError> {
        if let Some(value) = self.store().get(&keys::job_attempts(&job.job_id)).await? {
            return Ok(parse_attempt_count(&job.job_id, &value));
        }
        Ok(attempts_from_lineage(job))
    }

    async fn check_job(&self, job_id: &JobId) -> Result<Option<TimeoutResult>, JobError> {
        // Completed or expired between the registry scan and this read.
        let Some(job) = self.registry.get_job_status(job_id).await? else {
            return Ok(None);
        };
        if !self.is_job_timed_out(&job, None).await? {
            return Ok(None);
        }
        self.handle_timeout(&job).await.map(Some)
    }

    fn timeout_reason(
        &self,
        job: &JobMetadata,
        config: Option<&TimeoutConfig>,
        now: DateTime<Utc>,
    ) -> Option<TimeoutReason> {
        if job.status != JobStatus::Running {
            return None;
        }
        let started_at = job.started_at?;

        match config {
            Some(config) if !config.has_no_limits() => {
                if let Some(seconds) = config.timeout_seconds {
                    if elapsed_at_least(started_at, now, seconds) {
                        return Some(TimeoutReason::Elapsed { seconds });
                    }
                }
                if let Some(deadline) = config.deadline {
                    if now >= deadline {
                        return Some(TimeoutReason::Deadline(deadline));
                    }
                }
                None
            }
            _ => {
                let seconds = self.get_default_timeout(&job.job_type).as_secs();
                elapsed_at_least(started_at, now, seconds)
                    .then_some(TimeoutReason::Default { seconds })
            }
        }
    }

    /// Reason to report when a job is handled without having tripped a limit
    /// (e.g. a manual trigger).
    fn configured_reason(&self, job: &JobMetadata, config: Option<&TimeoutConfig>) -> TimeoutReason {
        match config {
            Some(TimeoutConfig {
                timeout_seconds: Some(seconds),
                ..
            }) => TimeoutReason::Elapsed { seconds: *seconds },
            Some(TimeoutConfig {
                deadline: Some(deadline),
                ..
            }) => TimeoutReason::Deadline(*deadline),
            _ => TimeoutReason::Default {
                seconds: self.get_default_timeout(&job.job_type).as_secs(),
            },
        }
    }
}

fn elapsed_at_least(started_at: DateTime<Utc>, now: DateTime<Utc>, seconds: u64) -> bool {
    let elapsed_ms = i128::from(now.signed_duration_since(started_at).num_milliseconds());
    elapsed_ms >= i128::from(seconds) * 1000
}

/// `attempt - 1` for a successor created by `handle_timeout`, 0 otherwise.
fn attempts_from_lineage(job: &JobMetadata) -> u32 {
    let Some(extra) = job.extra.as_ref() else {
        return 0;
    };
    if extra.get("retry_of").is_none() {
        return 0;
    }
    extra
        .get("attempt")
        .and_then(JsonValue::as_u64)
        .map_or(0, |attempt| {
            u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX)
        })
}

fn parse_attempt_count(job_id: &JobId, value: &JsonValue) -> u32 {
    let count = match value {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse::<u64>().ok(),
        JsonValue::Object(map) => match map.get("count") {
            Some(JsonValue::Number(n)) => n.as_u64(),
            Some(JsonValue::String(s)) => s.trim().parse::<u64>().ok(),
            _ => None,
        },
        _ => None,
    };

    match count {
        Some(c) => u32::try_from(c).unwrap_or(u32::MAX),
        None => {
            warn!(job_id = %job_id, value = %value, "unrecognised attempt counter, treating as 0");
            0
        }
    }
}

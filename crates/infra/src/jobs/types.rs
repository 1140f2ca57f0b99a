//! Core job types and policies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use camwatch_core::JobId;

/// Job lifecycle status.
///
/// `Pending → Running → {Completed, Failed, Cancelled}`; a pending job may
/// also go straight to `Failed`/`Cancelled`. Terminal states are final.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, no progress reported yet
    Pending,
    /// At least one progress update received
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored state of one job instance (`job:{id}:status`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    /// 0–100, clamped on write.
    pub progress: u8,
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set once, on the `Pending → Running` transition.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Set once, on entering a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Only set on `Completed`.
    #[serde(default)]
    pub result: Option<JsonValue>,
    /// Only set on `Failed` / `Cancelled`.
    #[serde(default)]
    pub error: Option<String>,
    /// Caller-supplied metadata, opaque to the registry.
    #[serde(default)]
    pub extra: Option<JsonValue>,
}

impl JobMetadata {
    pub fn new(
        job_id: JobId,
        job_type: impl Into<String>,
        extra: Option<JsonValue>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            status: JobStatus::Pending,
            progress: 0,
            message: None,
            created_at,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            extra,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Clamp a reported progress value into `0..=100`.
pub fn clamp_progress(progress: i64) -> u8 {
    progress.clamp(0, 100) as u8
}

/// Sorted-set score for a timestamp (fractional unix seconds).
pub fn timestamp_score(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

fn default_max_retry_attempts() -> u32 {
    3
}

/// Per-job timeout override (`job:{id}:timeout`).
///
/// When both `timeout_seconds` and `deadline` are set, whichever is reached
/// first trips the timeout. With neither set the job-type default applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Allowed running time, measured from `started_at`.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Absolute point in time after which the job is timed out.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: None,
            deadline: None,
            max_retry_attempts: default_max_retry_attempts(),
        }
    }
}

impl TimeoutConfig {
    pub fn with_timeout_seconds(seconds: u64) -> Self {
        Self {
            timeout_seconds: Some(seconds),
            ..Self::default()
        }
    }

    pub fn with_deadline(deadline: DateTime<Utc>) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// True when neither a relative nor an absolute limit is configured.
    pub fn has_no_limits(&self) -> bool {
        self.timeout_seconds.is_none() && self.deadline.is_none()
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::json!({
            "timeout_seconds": self.timeout_seconds,
            "deadline": self.deadline.map(|d| d.to_rfc3339()),
            "max_retry_attempts": self.max_retry_attempts,
        })
    }

    pub fn from_value(value: JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Outcome of handling one timed-out job. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeoutResult {
    pub job_id: JobId,
    pub job_type: String,
    pub was_rescheduled: bool,
    /// Attempts consumed including the one that just timed out.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub error_message: String,
    /// The successor job, when one was created.
    pub new_job_id: Option<JobId>,
}

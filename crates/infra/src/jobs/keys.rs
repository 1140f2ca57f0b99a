//! Store key layout.
//!
//! These names are shared with data already persisted by earlier deployments
//! and must not change.

use camwatch_core::JobId;

/// Sorted set of every job id, scored by creation time.
pub const JOB_STATUS_LIST: &str = "job:status:list";
/// Sorted set of non-terminal job ids, scored by registration time.
pub const ACTIVE_JOBS: &str = "jobs:active";
/// Sorted set of terminal job ids, scored by completion time.
pub const COMPLETED_JOBS: &str = "jobs:completed";

pub fn job_status(job_id: &JobId) -> String {
    format!("job:{job_id}:status")
}

pub fn job_timeout(job_id: &JobId) -> String {
    format!("job:{job_id}:timeout")
}

pub fn job_attempts(job_id: &JobId) -> String {
    format!("job:{job_id}:attempts")
}

//! Progress-reporting capability for long-running batch work.
//!
//! Workers that are not themselves scheduled through this subsystem (a
//! retention cleanup, a footage export) report into the same registry via
//! [`JobTracker`] instead of keeping a parallel bookkeeping of their own.

use serde_json::Value as JsonValue;

use camwatch_core::JobId;

use crate::kv_store::KvStore;

use super::error::JobError;
use super::status::JobStatusService;

pub const STARTED_MESSAGE: &str = "Job started";

#[async_trait::async_trait]
pub trait JobTracker: Send + Sync {
    /// Register a pending job.
    async fn create_job(
        &self,
        job_type: &str,
        metadata: Option<JsonValue>,
    ) -> Result<JobId, JobError>;

    /// Mark a pending job as running.
    async fn start_job(&self, job_id: &JobId) -> Result<(), JobError>;

    async fn update_progress(
        &self,
        job_id: &JobId,
        progress: i64,
        message: Option<String>,
    ) -> Result<(), JobError>;

    async fn complete_job(&self, job_id: &JobId, result: Option<JsonValue>)
        -> Result<(), JobError>;

    async fn fail_job(&self, job_id: &JobId, error: &str) -> Result<(), JobError>;
}

#[async_trait::async_trait]
impl<S: KvStore> JobTracker for JobStatusService<S> {
    async fn create_job(
        &self,
        job_type: &str,
        metadata: Option<JsonValue>,
    ) -> Result<JobId, JobError> {
        JobStatusService::start_job(self, None, job_type, metadata).await
    }

    async fn start_job(&self, job_id: &JobId) -> Result<(), JobError> {
        JobStatusService::update_progress(self, job_id, 0, Some(STARTED_MESSAGE.to_string()))
            .await
    }

    async fn update_progress(
        &self,
        job_id: &JobId,
        progress: i64,
        message: Option<String>,
    ) -> Result<(), JobError> {
        JobStatusService::update_progress(self, job_id, progress, message).await
    }

    async fn complete_job(
        &self,
        job_id: &JobId,
        result: Option<JsonValue>,
    ) -> Result<(), JobError> {
        JobStatusService::complete_job(self, job_id, result).await
    }

    async fn fail_job(&self, job_id: &JobId, error: &str) -> Result<(), JobError> {
        JobStatusService::fail_job(self, job_id, error).await
    }
}

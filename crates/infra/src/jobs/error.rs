use camwatch_core::JobId;

use crate::kv_store::KvError;

/// Job subsystem error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// No stored metadata for the job (never created, or expired).
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    Store(#[from] KvError),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl JobError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, JobError::NotFound(_))
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Serialization(err.to_string())
    }
}

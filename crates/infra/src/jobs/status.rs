//! Job registry: metadata lifecycle plus the scanning indexes.
//!
//! ## Storage
//!
//! - `job:{id}:status`: JSON [`JobMetadata`]; no TTL while the job is live,
//!   the completed-job TTL once it reaches a terminal state
//! - `job:status:list`: every id by creation time, capped on each insert
//! - `jobs:active` / `jobs:completed`: ids partitioned by lifecycle phase
//!
//! ## Concurrency
//!
//! Every operation is a short sequence of independent store calls. There is
//! no locking: callers must serialize their own calls per job id, and a
//! read-modify-write (e.g. two concurrent `update_progress`) can lose an
//! update. Nothing is cached, every read goes to the store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use camwatch_core::{Clock, JobId};

use crate::config::JobsConfig;
use crate::kv_store::KvStore;

use super::error::JobError;
use super::keys;
use super::types::{clamp_progress, timestamp_score, JobMetadata, JobStatus};

pub const COMPLETED_MESSAGE: &str = "Job completed successfully";
pub const CANCELLED_MESSAGE: &str = "Job cancelled";
pub const CANCELLED_ERROR: &str = "Job cancelled by user";

/// Index sizes, as reported by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub tracked: u64,
    pub active: u64,
    pub completed: u64,
}

/// Registry of job metadata backed by a [`KvStore`].
pub struct JobStatusService<S> {
    store: S,
    clock: Arc<dyn Clock>,
    completed_job_ttl: Duration,
    status_list_max_entries: u64,
    stale_active_threshold: Duration,
}

impl<S> std::fmt::Debug for JobStatusService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStatusService")
            .field("completed_job_ttl", &self.completed_job_ttl)
            .field("status_list_max_entries", &self.status_list_max_entries)
            .field("stale_active_threshold", &self.stale_active_threshold)
            .finish_non_exhaustive()
    }
}

impl<S: KvStore> JobStatusService<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: &JobsConfig) -> Self {
        Self {
            store,
            clock,
            completed_job_ttl: config.completed_job_ttl,
            status_list_max_entries: config.status_list_max_entries,
            stale_active_threshold: config.stale_active_threshold,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register a new pending job and return its id.
    ///
    /// A fresh id is generated when `job_id` is `None`. The time-ordered
    /// index is trimmed right after the insert.
    #[instrument(skip(self, metadata), err)]
    pub async fn start_job(
        &self,
        job_id: Option<JobId>,
        job_type: &str,
        metadata: Option<JsonValue>,
    ) -> Result<JobId, JobError> {
        let job_id = job_id.unwrap_or_default();
        let now = self.clock.now();
        let job = JobMetadata::new(job_id.clone(), job_type, metadata, now);

        self.persist(&job, None).await?;

        let score = timestamp_score(now);
        let member = vec![(job_id.to_string(), score)];
        self.store.zadd(keys::JOB_STATUS_LIST, &member).await?;
        self.store.zadd(keys::ACTIVE_JOBS, &member).await?;

        self.cleanup_job_status_list(self.status_list_max_entries)
            .await?;

        info!(job_id = %job_id, job_type, "job registered");
        Ok(job_id)
    }

    /// Record progress; the first update moves a pending job to running.
    #[instrument(skip(self, message), err)]
    pub async fn update_progress(
        &self,
        job_id: &JobId,
        progress: i64,
        message: Option<String>,
    ) -> Result<(), JobError> {
        let mut job = self.require(job_id).await?;
        if job.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "progress ignored for terminal job");
            return Ok(());
        }

        job.progress = clamp_progress(progress);
        if let Some(message) = message {
            job.message = Some(message);
        }
        if job.status == JobStatus::Pending {
            job.status = JobStatus::Running;
            job.started_at = Some(self.clock.now());
            debug!(job_id = %job_id, "job started");
        }

        self.persist(&job, None).await
    }

    #[instrument(skip(self, result), err)]
    pub async fn complete_job(
        &self,
        job_id: &JobId,
        result: Option<JsonValue>,
    ) -> Result<(), JobError> {
        let mut job = self.require(job_id).await?;

        job.status = JobStatus::Completed;
        job.progress = 100;
        job.completed_at = job.completed_at.or_else(|| Some(self.clock.now()));
        job.result = result;
        job.message = Some(COMPLETED_MESSAGE.to_string());

        self.finish(&job).await?;
        info!(job_id = %job_id, job_type = %job.job_type, "job completed");
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn fail_job(&self, job_id: &JobId, error: &str) -> Result<(), JobError> {
        let mut job = self.require(job_id).await?;

        job.status = JobStatus::Failed;
        job.completed_at = job.completed_at.or_else(|| Some(self.clock.now()));
        job.error = Some(error.to_string());

        self.finish(&job).await?;
        warn!(job_id = %job_id, job_type = %job.job_type, error, "job failed");
        Ok(())
    }

    /// Cancel a job. Returns `false` (and changes nothing) when the job has
    /// already reached a terminal state.
    #[instrument(skip(self), err)]
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<bool, JobError> {
        let mut job = self.require(job_id).await?;
        if job.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "cancel ignored for terminal job");
            return Ok(false);
        }

        job.status = JobStatus::Cancelled;
        job.completed_at = Some(self.clock.now());
        job.error = Some(CANCELLED_ERROR.to_string());
        job.message = Some(CANCELLED_MESSAGE.to_string());

        self.finish(&job).await?;
        info!(job_id = %job_id, "job cancelled");
        Ok(true)
    }

    /// Stored metadata, or `None` when missing or unreadable.
    pub async fn get_job_status(&self, job_id: &JobId) -> Result<Option<JobMetadata>, JobError> {
        let Some(raw) = self.store.get(&keys::job_status(job_id)).await? else {
            return Ok(None);
        };
        Ok(decode(job_id, raw))
    }

    /// Most recently created jobs first, optionally filtered by status.
    ///
    /// Ids whose metadata has expired are dropped from the index on the way.
    pub async fn list_jobs(
        &self,
        status_filter: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobMetadata>, JobError> {
        let mut jobs = Vec::new();
        if limit == 0 {
            return Ok(jobs);
        }

        let ids = self.store.zrevrange(keys::JOB_STATUS_LIST, 0, -1).await?;
        for id in ids {
            let job_id = JobId::from(id);
            let Some(raw) = self.store.get(&keys::job_status(&job_id)).await? else {
                self.store.zrem(keys::JOB_STATUS_LIST, job_id.as_str()).await?;
                continue;
            };
            let Some(job) = decode(&job_id, raw) else {
                continue;
            };
            if status_filter.is_some_and(|s| s != job.status) {
                continue;
            }
            jobs.push(job);
            if jobs.len() >= limit {
                break;
            }
        }

        Ok(jobs)
    }

    /// Oldest-registered active job ids.
    pub async fn get_active_job_ids(&self, limit: usize) -> Result<Vec<JobId>, JobError> {
        self.scan_ids(keys::ACTIVE_JOBS, limit).await
    }

    /// Every active job id, oldest first, read in pages of `batch_size`.
    pub async fn get_all_active_job_ids(&self, batch_size: usize) -> Result<Vec<JobId>, JobError> {
        let batch = i64::try_from(batch_size.max(1)).unwrap_or(i64::MAX);
        let mut ids = Vec::new();
        let mut offset = 0i64;
        loop {
            let page = self
                .store
                .zrange(keys::ACTIVE_JOBS, offset, offset.saturating_add(batch - 1))
                .await?;
            let len = page.len() as i64;
            ids.extend(page.into_iter().map(JobId::from));
            if len < batch {
                return Ok(ids);
            }
            offset = offset.saturating_add(batch);
        }
    }

    /// Oldest-completed terminal job ids.
    pub async fn get_completed_job_ids(&self, limit: usize) -> Result<Vec<JobId>, JobError> {
        self.scan_ids(keys::COMPLETED_JOBS, limit).await
    }

    /// Drop completed-registry entries older than `retention`.
    ///
    /// The job keys themselves expire through their TTL; this only bounds the
    /// index.
    pub async fn cleanup_completed_jobs(&self, retention: Duration) -> Result<u64, JobError> {
        let cutoff = self.cutoff_score(retention)?;
        let removed = self
            .store
            .zremrangebyscore(keys::COMPLETED_JOBS, f64::NEG_INFINITY, cutoff)
            .await?;
        if removed > 0 {
            info!(removed, "pruned completed job registry");
        }
        Ok(removed)
    }

    /// Drop active-registry entries older than `threshold` (default from
    /// config). Such jobs most likely belong to a crashed process; their
    /// metadata is left alone.
    pub async fn cleanup_stale_active_jobs(
        &self,
        threshold: Option<Duration>,
    ) -> Result<u64, JobError> {
        let cutoff = self.cutoff_score(threshold.unwrap_or(self.stale_active_threshold))?;
        let removed = self
            .store
            .zremrangebyscore(keys::ACTIVE_JOBS, f64::NEG_INFINITY, cutoff)
            .await?;
        if removed > 0 {
            warn!(removed, "dropped stale entries from active job registry");
        }
        Ok(removed)
    }

    /// Keep only the `max_entries` most recently created ids in the index.
    pub async fn cleanup_job_status_list(&self, max_entries: u64) -> Result<u64, JobError> {
        let count = self.store.zcard(keys::JOB_STATUS_LIST).await?;
        if count <= max_entries {
            return Ok(0);
        }
        let excess = (count - max_entries) as i64;
        let removed = self
            .store
            .zremrangebyrank(keys::JOB_STATUS_LIST, 0, excess - 1)
            .await?;
        debug!(removed, max_entries, "trimmed job status list");
        Ok(removed)
    }

    pub async fn get_registry_stats(&self) -> Result<RegistryStats, JobError> {
        Ok(RegistryStats {
            tracked: self.store.zcard(keys::JOB_STATUS_LIST).await?,
            active: self.store.zcard(keys::ACTIVE_JOBS).await?,
            completed: self.store.zcard(keys::COMPLETED_JOBS).await?,
        })
    }

    async fn require(&self, job_id: &JobId) -> Result<JobMetadata, JobError> {
        self.get_job_status(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.clone()))
    }

    async fn persist(&self, job: &JobMetadata, ttl: Option<Duration>) -> Result<(), JobError> {
        let value = serde_json::to_value(job)?;
        self.store
            .set(&keys::job_status(&job.job_id), &value, ttl)
            .await?;
        Ok(())
    }

    /// Write a terminal job and move it from the active to the completed
    /// registry.
    async fn finish(&self, job: &JobMetadata) -> Result<(), JobError> {
        self.persist(job, Some(self.completed_job_ttl)).await?;

        let member = job.job_id.as_str();
        self.store.zrem(keys::ACTIVE_JOBS, member).await?;
        let score = timestamp_score(job.completed_at.unwrap_or_else(|| self.clock.now()));
        self.store
            .zadd(keys::COMPLETED_JOBS, &[(member.to_string(), score)])
            .await?;
        Ok(())
    }

    async fn scan_ids(&self, key: &str, limit: usize) -> Result<Vec<JobId>, JobError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = i64::try_from(limit).unwrap_or(i64::MAX) - 1;
        let ids = self.store.zrange(key, 0, stop).await?;
        Ok(ids.into_iter().map(JobId::from).collect())
    }

    fn cutoff_score(&self, age: Duration) -> Result<f64, JobError> {
        let age = chrono::Duration::from_std(age)
            .map_err(|e| JobError::Serialization(format!("invalid duration: {e}")))?;
        Ok(timestamp_score(self.clock.now() - age))
    }
}

fn decode(job_id: &JobId, raw: JsonValue) -> Option<JobMetadata> {
    match serde_json::from_value::<JobMetadata>(raw) {
        Ok(job) => Some(job),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "ignoring unreadable job metadata");
            None
        }
    }
}

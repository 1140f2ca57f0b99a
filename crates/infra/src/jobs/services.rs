//! Wiring for the job subsystem.

use std::sync::Arc;

use camwatch_core::Clock;

use crate::config::JobsConfig;
use crate::kv_store::{InMemoryKvStore, KvStore};

use super::checker::TimeoutCheckerJob;
use super::status::JobStatusService;
use super::timeout::JobTimeoutService;

/// Registry, timeout service and checker built over one store and clock.
pub struct JobServices<S> {
    pub status: Arc<JobStatusService<S>>,
    pub timeouts: Arc<JobTimeoutService<S>>,
    pub checker: Arc<TimeoutCheckerJob<S>>,
}

impl<S> Clone for JobServices<S> {
    fn clone(&self) -> Self {
        Self {
            status: self.status.clone(),
            timeouts: self.timeouts.clone(),
            checker: self.checker.clone(),
        }
    }
}

impl<S: KvStore + 'static> JobServices<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: &JobsConfig) -> Self {
        let status = Arc::new(JobStatusService::new(store, clock.clone(), config));
        let timeouts = Arc::new(JobTimeoutService::new(status.clone(), clock, config));
        let checker = Arc::new(TimeoutCheckerJob::new(timeouts.clone(), config));
        Self {
            status,
            timeouts,
            checker,
        }
    }
}

impl JobServices<Arc<InMemoryKvStore>> {
    /// Fresh services over a private in-memory store sharing `clock`.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::in_memory_with_config(clock, &JobsConfig::default())
    }

    pub fn in_memory_with_config(clock: Arc<dyn Clock>, config: &JobsConfig) -> Self {
        let store = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        Self::new(store, clock, config)
    }
}

//! Polling scheduler that periodically runs the timeout scan.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::JobsConfig;
use crate::kv_store::KvStore;

use super::error::JobError;
use super::timeout::JobTimeoutService;

/// Checker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CheckerStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub jobs_timed_out: u64,
    pub jobs_rescheduled: u64,
}

/// Background task running [`JobTimeoutService::check_for_timeouts`] every
/// `check_interval`.
///
/// At most one loop runs per instance. A failed cycle is logged and the loop
/// keeps going.
pub struct TimeoutCheckerJob<S> {
    timeouts: Arc<JobTimeoutService<S>>,
    interval: Duration,
    shutdown_grace: Duration,
    running: AtomicBool,
    task: Mutex<Option<LoopHandle>>,
    stats: Arc<Mutex<CheckerStats>>,
}

struct LoopHandle {
    join: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl<S: KvStore + 'static> TimeoutCheckerJob<S> {
    pub fn new(timeouts: Arc<JobTimeoutService<S>>, config: &JobsConfig) -> Self {
        Self {
            timeouts,
            interval: config.check_interval,
            shutdown_grace: config.shutdown_grace,
            running: AtomicBool::new(false),
            task: Mutex::new(None),
            stats: Arc::new(Mutex::new(CheckerStats::default())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CheckerStats {
        lock(&self.stats).clone()
    }

    /// Spawn the polling loop. No-op if it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        // Flag and handle change together under the task lock.
        let mut task = lock(&self.task);
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("timeout checker already running");
            return;
        }

        let timeouts = self.timeouts.clone();
        let stats = self.stats.clone();
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let interval = self.interval;

        let join = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs_f64(), "timeout checker started");

            loop {
                if let Err(e) = run_cycle(&timeouts, &stats).await {
                    error!(error = %e, "timeout check cycle failed");
                }

                tokio::select! {
                    _ = signal.notified() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            info!("timeout checker stopped");
        });

        *task = Some(LoopHandle { join, shutdown });
    }

    /// Stop the polling loop and wait for it to exit. No-op if not running.
    ///
    /// An in-flight cycle gets `shutdown_grace` to finish before the task is
    /// aborted.
    pub async fn stop(&self) {
        let running = {
            let mut task = lock(&self.task);
            if !self.running.swap(false, Ordering::SeqCst) {
                return;
            }
            task.take()
        };
        let Some(LoopHandle { join: mut handle, shutdown }) = running else {
            return;
        };
        // notify_one stores a permit, so a loop that is mid-cycle still sees it.
        shutdown.notify_one();

        match tokio::time::timeout(self.shutdown_grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => error!(error = %e, "timeout checker task panicked"),
            Err(_) => {
                warn!(
                    grace_secs = self.shutdown_grace.as_secs_f64(),
                    "timeout checker did not stop in time, aborting"
                );
                handle.abort();
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        error!(error = %e, "timeout checker task panicked");
                    }
                }
            }
        }
    }

    /// Run a single scan and return how many jobs were handled.
    pub async fn run_once(&self) -> Result<usize, JobError> {
        run_cycle(&self.timeouts, &self.stats).await
    }
}

impl<S> Drop for TimeoutCheckerJob<S> {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.task).take() {
            running.join.abort();
        }
    }
}

async fn run_cycle<S: KvStore>(
    timeouts: &JobTimeoutService<S>,
    stats: &Mutex<CheckerStats>,
) -> Result<usize, JobError> {
    let outcome = timeouts.check_for_timeouts().await;

    let mut stats = lock(stats);
    stats.cycles += 1;
    match outcome {
        Ok(results) => {
            let rescheduled = results.iter().filter(|r| r.was_rescheduled).count();
            stats.jobs_timed_out += results.len() as u64;
            stats.jobs_rescheduled += rescheduled as u64;
            Ok(results.len())
        }
        Err(e) => {
            stats.failed_cycles += 1;
            Err(e)
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camwatch_core::{Clock, JobId, ManualClock};

    use crate::jobs::status::JobStatusService;
    use crate::jobs::types::{JobStatus, TimeoutConfig};
    use crate::kv_store::InMemoryKvStore;

    type Store = Arc<InMemoryKvStore>;

    fn build(check_interval: Duration) -> (TimeoutCheckerJob<Store>, Arc<JobTimeoutService<Store>>) {
        let clock = ManualClock::starting_now();
        let config = JobsConfig::default().with_check_interval(check_interval);
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let store = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let registry = Arc::new(JobStatusService::new(store, clock.clone(), &config));
        let timeouts = Arc::new(JobTimeoutService::new(registry, clock, &config));
        (TimeoutCheckerJob::new(timeouts.clone(), &config), timeouts)
    }

    async fn timed_out_job(timeouts: &JobTimeoutService<Store>, max_attempts: u32) -> JobId {
        let registry = timeouts.registry();
        let id = registry.start_job(None, "export", None).await.unwrap();
        registry.update_progress(&id, 50, None).await.unwrap();
        timeouts
            .set_timeout_config(
                &id,
                &TimeoutConfig::with_timeout_seconds(0).max_retry_attempts(max_attempts),
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let (checker, _) = build(Duration::from_millis(10));

        assert!(!checker.is_running());
        checker.stop().await;

        checker.start();
        checker.start();
        assert!(checker.is_running());

        checker.stop().await;
        assert!(!checker.is_running());
        checker.stop().await;

        checker.start();
        assert!(checker.is_running());
        checker.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_start_and_stop_leave_no_detached_loop() {
        let (checker, _) = build(Duration::from_millis(5));
        let checker = Arc::new(checker);

        for _ in 0..50 {
            let starter = {
                let checker = checker.clone();
                tokio::spawn(async move { checker.start() })
            };
            let stopper = {
                let checker = checker.clone();
                tokio::spawn(async move { checker.stop().await })
            };
            starter.await.unwrap();
            stopper.await.unwrap();

            // Whatever the interleaving, flag and handle agree.
            assert_eq!(checker.is_running(), lock(&checker.task).is_some());
            checker.stop().await;
            assert!(!checker.is_running());
            assert!(lock(&checker.task).is_none());
        }
    }

    #[tokio::test]
    async fn run_once_handles_timed_out_jobs_and_counts_them() {
        let (checker, timeouts) = build(Duration::from_secs(30));
        let id = timed_out_job(&timeouts, 3).await;

        assert_eq!(checker.run_once().await.unwrap(), 1);
        assert_eq!(checker.run_once().await.unwrap(), 0);

        let job = timeouts.registry().get_job_status(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        let stats = checker.stats();
        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.failed_cycles, 0);
        assert_eq!(stats.jobs_timed_out, 1);
        assert_eq!(stats.jobs_rescheduled, 1);
    }

    #[tokio::test]
    async fn background_loop_fails_timed_out_jobs() {
        let (checker, timeouts) = build(Duration::from_millis(10));
        let id = timed_out_job(&timeouts, 1).await;

        checker.start();

        let failed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job = timeouts.registry().get_job_status(&id).await.unwrap().unwrap();
                if job.status == JobStatus::Failed {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("checker never handled the job");

        checker.stop().await;

        assert!(failed.error.unwrap().contains("timed out"));
        assert!(checker.stats().cycles >= 1);
        assert_eq!(checker.stats().jobs_rescheduled, 0);
    }
}

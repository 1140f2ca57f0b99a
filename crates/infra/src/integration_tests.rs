//! Integration tests for the job lifecycle across registry, timeout service
//! and checker.
//!
//! Verifies:
//! - A timed-out job is failed by a checker cycle
//! - Retry chains carry policy and attempt count until exhaustion
//! - Registry indexes stay consistent through TTL expiry and cleanup

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use camwatch_core::{Clock, JobId, ManualClock};

    use crate::config::JobsConfig;
    use crate::jobs::{JobServices, JobStatus, JobTracker, TimeoutConfig};
    use crate::kv_store::{InMemoryKvStore, KvStore};

    fn setup() -> (JobServices<Arc<InMemoryKvStore>>, ManualClock) {
        let clock = ManualClock::starting_now();
        let services = JobServices::in_memory(Arc::new(clock.clone()));
        (services, clock)
    }

    #[tokio::test]
    async fn checker_cycle_fails_timed_out_export_job() {
        let (services, _clock) = setup();

        let id = services.status.start_job(None, "export", None).await.unwrap();
        services.status.update_progress(&id, 50, None).await.unwrap();
        services
            .timeouts
            .set_timeout_config(&id, &TimeoutConfig::with_timeout_seconds(0).max_retry_attempts(1))
            .await
            .unwrap();

        assert_eq!(services.checker.run_once().await.unwrap(), 1);

        let job = services.status.get_job_status(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("timed out"));
        assert!(services.status.get_active_job_ids(10).await.unwrap().is_empty());
        assert_eq!(services.status.get_completed_job_ids(10).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn retry_chain_runs_until_attempts_are_exhausted() {
        let (services, _clock) = setup();
        let config = TimeoutConfig::with_timeout_seconds(0).max_retry_attempts(3);

        let first = services
            .status
            .start_job(None, "export", Some(json!({"camera": "lobby"})))
            .await
            .unwrap();
        services.timeouts.set_timeout_config(&first, &config).await.unwrap();

        let mut current = first.clone();
        let mut chain = vec![first.clone()];
        loop {
            services.status.update_progress(&current, 5, None).await.unwrap();
            let results = services.timeouts.check_for_timeouts().await.unwrap();
            assert_eq!(results.len(), 1);
            let result = &results[0];
            assert_eq!(result.job_id, current);

            match &result.new_job_id {
                Some(next) => {
                    let successor = services.status.get_job_status(next).await.unwrap().unwrap();
                    assert_eq!(successor.status, JobStatus::Pending);
                    assert_eq!(successor.extra.unwrap()["retry_of"], json!(current.as_str()));
                    current = next.clone();
                    chain.push(current.clone());
                }
                None => {
                    assert_eq!(result.attempt_count, 3);
                    break;
                }
            }
        }

        assert_eq!(chain.len(), 3);
        for id in &chain {
            let job = services.status.get_job_status(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Failed);
        }

        let second = services.status.get_job_status(&chain[1]).await.unwrap().unwrap();
        let second_extra = second.extra.unwrap();
        assert_eq!(second_extra["attempt"], json!(2));
        assert_eq!(second_extra["original_extra"]["camera"], json!("lobby"));

        // Each successor wraps its predecessor's metadata.
        let third = services.status.get_job_status(&chain[2]).await.unwrap().unwrap();
        let third_extra = third.extra.unwrap();
        assert_eq!(third_extra["attempt"], json!(3));
        assert_eq!(third_extra["original_extra"]["retry_of"], json!(first.as_str()));

        assert!(services.status.list_jobs(Some(JobStatus::Pending), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_successor_keeps_its_timeout_data() {
        let (services, _clock) = setup();
        let id = services.status.start_job(None, "backup", None).await.unwrap();
        services.status.update_progress(&id, 1, None).await.unwrap();
        services
            .timeouts
            .set_timeout_config(&id, &TimeoutConfig::with_timeout_seconds(0))
            .await
            .unwrap();

        let result = services.timeouts.check_for_timeouts().await.unwrap().remove(0);
        let successor = result.new_job_id.unwrap();

        assert!(services.status.cancel_job(&successor).await.unwrap());

        assert!(services.timeouts.get_timeout_config(&successor).await.unwrap().is_some());
        assert_eq!(services.timeouts.get_attempt_count(&successor).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn finished_jobs_expire_and_drop_out_of_listings() {
        let (services, clock) = setup();
        let done = services.status.start_job(None, "cleanup", None).await.unwrap();
        let live = services.status.start_job(None, "cleanup", None).await.unwrap();
        services.status.complete_job(&done, Some(json!({"removed": 12}))).await.unwrap();

        clock.advance(chrono::Duration::seconds(3600));

        assert!(services.status.get_job_status(&done).await.unwrap().is_none());
        let listed: Vec<JobId> = services
            .status
            .list_jobs(None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.job_id)
            .collect();
        assert_eq!(listed, vec![live]);

        // Expired id was pruned from the creation index while listing.
        assert_eq!(services.status.get_registry_stats().await.unwrap().tracked, 1);
        assert_eq!(
            services.status.cleanup_completed_jobs(Duration::from_secs(60)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn status_list_cap_keeps_most_recent_ids() {
        let clock = ManualClock::starting_now();
        let config = JobsConfig::default().with_status_list_max_entries(1_000);
        let services = JobServices::in_memory_with_config(Arc::new(clock.clone()), &config);

        let mut created = Vec::new();
        for _ in 0..15 {
            created.push(services.status.start_job(None, "export", None).await.unwrap());
            clock.advance_secs(1);
        }

        assert_eq!(services.status.cleanup_job_status_list(10).await.unwrap(), 5);

        let listed: Vec<JobId> = services
            .status
            .list_jobs(None, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.job_id)
            .collect();
        let expected: Vec<JobId> = created.iter().rev().take(10).cloned().collect();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn tracker_reports_into_the_shared_registry() {
        let (services, clock) = setup();
        let tracker: Arc<dyn JobTracker> = services.status.clone();

        let id = tracker
            .create_job("retention", Some(json!({"days": 30})))
            .await
            .unwrap();
        tracker.start_job(&id).await.unwrap();

        // Default retention timeout is an hour.
        clock.advance_secs(3599);
        assert_eq!(services.checker.run_once().await.unwrap(), 0);

        tracker.complete_job(&id, None).await.unwrap();
        clock.advance_secs(10);
        assert_eq!(services.checker.run_once().await.unwrap(), 0);

        let job = services.status.get_job_status(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(services.checker.stats().jobs_timed_out, 0);
    }

    #[tokio::test]
    async fn registry_keys_match_the_documented_layout() {
        let (services, clock) = setup();
        let id = services
            .status
            .start_job(Some(JobId::from("job-42")), "export", None)
            .await
            .unwrap();
        services.timeouts.increment_attempt_count(&id).await.unwrap();

        let store = services.status.store();
        assert!(store.get("job:job-42:status").await.unwrap().is_some());
        assert_eq!(
            store.get("job:job-42:attempts").await.unwrap(),
            Some(json!({"count": 1}))
        );
        assert_eq!(
            store.zscore("job:status:list", "job-42").await.unwrap(),
            Some(crate::jobs::types::timestamp_score(clock.now()))
        );
        assert!(store.zscore("jobs:active", "job-42").await.unwrap().is_some());
    }
}

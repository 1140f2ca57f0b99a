use std::sync::Arc;

use anyhow::Context;

use camwatch_core::SystemClock;
use camwatch_infra::config::JobsConfig;
use camwatch_infra::jobs::JobServices;
use camwatch_infra::kv_store::RedisKvStore;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    camwatch_observability::init();

    let config = JobsConfig::from_env().context("invalid job configuration")?;

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| {
        tracing::warn!("REDIS_URL not set; using {DEFAULT_REDIS_URL}");
        DEFAULT_REDIS_URL.to_string()
    });
    let store = RedisKvStore::connect(&redis_url)
        .await
        .with_context(|| format!("failed to connect to {redis_url}"))?;

    let services = JobServices::new(Arc::new(store), Arc::new(SystemClock), &config);

    match services.status.get_registry_stats().await {
        Ok(stats) => tracing::info!(
            tracked = stats.tracked,
            active = stats.active,
            completed = stats.completed,
            "job registry reachable"
        ),
        Err(e) => tracing::warn!(error = %e, "could not read job registry stats"),
    }

    services.checker.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    services.checker.stop().await;

    let stats = services.checker.stats();
    tracing::info!(
        cycles = stats.cycles,
        failed_cycles = stats.failed_cycles,
        jobs_timed_out = stats.jobs_timed_out,
        jobs_rescheduled = stats.jobs_rescheduled,
        "timeout checker summary"
    );

    Ok(())
}

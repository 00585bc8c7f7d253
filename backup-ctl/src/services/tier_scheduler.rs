use crate::state::AppState;
use backup_engine::scheduler::{recover_interrupted, MarkerState, RunStatus};
use backup_engine::TriggerResult;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// One cron job per tier. Each job awaits its run to completion; a tick
/// that lands while the tier is still running coalesces in the engine.
/// Runs are tracked in `AppState::tasks` so shutdown can wait for them.
pub struct TierCron {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl TierCron {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    pub async fn schedule_tier(&self, tier: &str, cron_expression: &str) -> anyhow::Result<()> {
        let state = self.state.clone();
        let tier_name = tier.to_string();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let state = state.clone();
            let tier = tier_name.clone();
            Box::pin(run_scheduled(state, tier))
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(tier = %tier, cron = %cron_expression, "Tier scheduled");
        Ok(())
    }

    /// Settle runs interrupted before this process started, then register
    /// every tier's schedule.
    pub async fn init_schedules(&self) -> anyhow::Result<()> {
        let tiers = self.state.ctx.config.backup_tiers()?;

        for tier in &tiers {
            match recover_interrupted(&self.state.ctx.layout, &tier.name) {
                Ok(MarkerState::Recovered(marker)) => {
                    tracing::warn!(tier = %tier.name, run_id = %marker.run_id, "Interrupted run recorded as failed");
                    self.state.ctx.scheduler.record_outcome(&tier.name, RunStatus::Failed);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(tier = %tier.name, error = %e, "Run marker recovery failed"),
            }
        }

        let mut count = 0;
        for tier in &tiers {
            if tier.schedule.is_empty() {
                continue;
            }
            if let Err(e) = self.schedule_tier(&tier.name, &tier.schedule).await {
                tracing::error!(tier = %tier.name, cron = %tier.schedule, error = %e, "Failed to schedule tier");
            } else {
                count += 1;
            }
        }

        tracing::info!(count, "Tier schedules initialized");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

/// Body of a tier's cron job. The run is tracked so shutdown waits for it;
/// once shutdown has begun the tick is ignored.
pub(crate) async fn run_scheduled(state: Arc<AppState>, tier: String) {
    if !state.accepting_work() {
        tracing::info!(tier = %tier, "Shutting down, scheduled trigger ignored");
        return;
    }
    tracing::info!(tier = %tier, "Scheduled trigger");
    match state.tasks.track_future(state.executor.trigger(&tier)).await {
        Ok(TriggerResult::Completed(report)) if report.succeeded() => {
            tracing::info!(tier = %tier, run_id = %report.run_id, "Scheduled backup finished");
        }
        Ok(TriggerResult::Completed(report)) => {
            tracing::error!(tier = %tier, run_id = %report.run_id, errors = ?report.errors, "Scheduled backup failed");
        }
        Ok(TriggerResult::Coalesced { running_run, .. }) => {
            tracing::warn!(tier = %tier, %running_run, "Skipping scheduled run: tier already running");
        }
        Err(e) => tracing::error!(tier = %tier, error = %e, "Scheduled backup could not start"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_drain_waits_for_scheduled_run() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("stack")).unwrap();
        std::fs::write(dir.path().join("stack/prometheus.yml"), b"global: {}").unwrap();
        let state = test_state(&dir);

        let job = tokio::spawn(run_scheduled(state.clone(), "critical".to_string()));
        // Let the job reach the executor before shutdown begins.
        while state.tasks.is_empty() && !job.is_finished() {
            tokio::task::yield_now().await;
        }
        assert!(state.drain(Duration::from_secs(30)).await);

        let tier = state.ctx.scheduler.state("critical").unwrap();
        assert!(tier.last_outcome.is_some());
        assert!(!state.ctx.layout.run_marker("critical").exists());
        job.await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_after_shutdown_is_ignored() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        assert!(state.drain(Duration::from_secs(1)).await);

        run_scheduled(state.clone(), "critical".to_string()).await;
        let tier = state.ctx.scheduler.state("critical").unwrap();
        assert_eq!(tier.last_outcome, None);
        assert!(!state.ctx.layout.tier_dir("critical").exists());
    }
}

use backup_engine::{BackupExecutor, EngineContext, HealthMonitor, HealthReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;

/// Shared by the cron jobs, the health loop and the status routes.
pub struct AppState {
    pub ctx: Arc<EngineContext>,
    pub executor: BackupExecutor,
    pub monitor: HealthMonitor,
    pub last_health: RwLock<Option<HealthReport>>,
    /// Backup runs and health checks in flight; shutdown waits on these so
    /// post-hooks get to restart quiesced services.
    pub tasks: TaskTracker,
}

impl AppState {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            executor: BackupExecutor::new(ctx.clone()),
            monitor: HealthMonitor::new(ctx.clone()),
            ctx,
            last_health: RwLock::new(None),
            tasks: TaskTracker::new(),
        }
    }

    /// Stop accepting work and wait for tracked tasks, at most `grace`.
    /// Returns false when tasks were still running at the deadline.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tasks.close();
        if !self.tasks.is_empty() {
            tracing::info!(pending = self.tasks.len(), "Waiting for in-flight backup work");
        }
        match tokio::time::timeout(grace, self.tasks.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    pending = self.tasks.len(),
                    grace = ?grace,
                    "Backup work still running at shutdown deadline"
                );
                false
            }
        }
    }

    /// False once shutdown has begun.
    pub fn accepting_work(&self) -> bool {
        !self.tasks.is_closed()
    }
}

#[cfg(test)]
pub(crate) fn test_state(dir: &tempfile::TempDir) -> Arc<AppState> {
    use backup_engine::Config;

    let toml = format!(
        r#"
[storage]
root = "{}"

[[tiers]]
name = "critical"
schedule = "0 0 2 * * *"
retention = "7d"
warn_after = "26h"

[[tiers.sources]]
name = "stack-config"
kind = "path"
path = "{}"
"#,
        dir.path().join("backups").display(),
        dir.path().join("stack").display()
    );
    let config = Config::from_toml_str(&toml).unwrap();
    let ctx = Arc::new(EngineContext::from_config(config).unwrap());
    Arc::new(AppState::new(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_run() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let restarted = Arc::new(AtomicBool::new(false));

        let flag = restarted.clone();
        state.tasks.spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            flag.store(true, Ordering::SeqCst);
        });

        assert!(state.accepting_work());
        assert!(state.drain(Duration::from_secs(5)).await);
        assert!(restarted.load(Ordering::SeqCst));
        assert!(!state.accepting_work());
    }

    #[tokio::test]
    async fn test_drain_gives_up_at_deadline() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        state.tasks.spawn(tokio::time::sleep(Duration::from_secs(30)));

        assert!(!state.drain(Duration::from_millis(50)).await);
        assert_eq!(state.tasks.len(), 1);
    }
}

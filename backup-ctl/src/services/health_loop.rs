use crate::state::AppState;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Run the health monitor on its own cadence, independent of backup runs.
pub fn start_health_loop(state: Arc<AppState>, cancel: CancellationToken) {
    let tasks = state.tasks.clone();
    tasks.spawn(async move {
        let mut interval = tokio::time::interval(state.ctx.config.health.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match state.monitor.run().await {
                        Ok(report) => {
                            for issue in report.issues() {
                                tracing::warn!(verdict = report.verdict.as_str(), "{}", issue);
                            }
                            *state.last_health.write().await = Some(report);
                        }
                        Err(e) => tracing::error!(error = %e, "Health check failed"),
                    }
                }
            }
        }
        tracing::info!("Health loop stopped");
    });
}

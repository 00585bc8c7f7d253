//! Backup run executor - drives one tier run end to end.
//!
//! Pipeline per run:
//! - recover an interrupted previous run, write the run marker
//! - pre-hooks per source (quiesce, snapshot, export, volume copy)
//! - archive build (temp file, verify, publish, latest pointer)
//! - post-hooks, always, whatever happened above
//! - replication and retention after a published archive
//!
//! Outcomes are collected into a `RunReport`; nothing below the scheduler
//! decides process exit codes.

pub mod report;

use chrono::Utc;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveBuilder, BuildRequest, Destination};
use crate::context::EngineContext;
use crate::hooks::PreOutcome;
use crate::models::{BackupTier, SourceInclusion};
use crate::retention;
use crate::scheduler::{MarkerClaim, RunMarker, TriggerOutcome};
use crate::utils::errors::Result;
use crate::utils::logger::RunLog;

pub use report::{ArchiveSummary, RunReport, SourceReport, SourceStatus};

const REVISION_TIMEOUT: Duration = Duration::from_secs(10);

/// What a trigger amounted to.
#[derive(Debug, Clone)]
pub enum TriggerResult {
    Completed(RunReport),
    /// A run of this tier was in progress; the trigger was dropped.
    Coalesced { tier: String, running_run: String },
}

#[derive(Clone)]
pub struct BackupExecutor {
    ctx: Arc<EngineContext>,
}

impl BackupExecutor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Trigger a tier now. Returns once the run has finished, or
    /// immediately when the trigger coalesces into a running run.
    pub async fn trigger(&self, tier_name: &str) -> Result<TriggerResult> {
        let tier = self.ctx.config.tier(tier_name)?;

        let permit = match self.ctx.scheduler.try_start(tier_name)? {
            TriggerOutcome::Started(permit) => permit,
            TriggerOutcome::Coalesced { running_run } => {
                return Ok(TriggerResult::Coalesced {
                    tier: tier_name.to_string(),
                    running_run,
                })
            }
        };

        let run_id = permit.run_id().to_string();
        let started_at = Utc::now();

        let recovered = match RunMarker::claim(&self.ctx.layout, &tier.name, &run_id) {
            Ok(MarkerClaim::Claimed { recovered, .. }) => Ok(recovered),
            Ok(MarkerClaim::ActiveElsewhere(marker)) => {
                info!(
                    tier = %tier.name,
                    pid = marker.pid,
                    run_id = %marker.run_id,
                    "Tier is running in another process, trigger coalesced"
                );
                permit.coalesce();
                return Ok(TriggerResult::Coalesced {
                    tier: tier.name.clone(),
                    running_run: marker.run_id,
                });
            }
            Err(e) => Err(e),
        };
        info!(tier = %tier.name, %run_id, "Backup run started");

        let report = match recovered {
            Ok(recovered) => match AssertUnwindSafe(self.execute(&tier, &run_id, recovered)).catch_unwind().await {
                Ok(report) => report,
                Err(_) => {
                    error!(tier = %tier.name, %run_id, "Backup run panicked");
                    RunMarker::clear(&self.ctx.layout, &tier.name);
                    RunReport::new(&tier.name, &run_id, started_at).failed("run panicked")
                }
            },
            Err(e) => RunReport::new(&tier.name, &run_id, started_at).failed(format!("cannot write run marker: {}", e)),
        };

        if report.succeeded() {
            info!(tier = %tier.name, %run_id, warnings = report.warnings.len(), "Backup run succeeded");
        } else {
            error!(tier = %tier.name, %run_id, errors = ?report.errors, "Backup run failed");
        }

        permit.finish(report.status);
        Ok(TriggerResult::Completed(report))
    }

    /// Runs with the tier's marker already claimed; clears it on the way out.
    async fn execute(&self, tier: &BackupTier, run_id: &str, recovered: Option<RunMarker>) -> RunReport {
        let layout = &self.ctx.layout;
        let mut report = RunReport::new(&tier.name, run_id, Utc::now());

        if let Some(marker) = recovered {
            report.warn(format!(
                "previous run {} was interrupted and has been recorded as failed",
                marker.run_id
            ));
        }

        let log_path = layout.run_log(&tier.name, run_id);
        let log = Arc::new(RunLog::open(&log_path));
        report.log_path = Some(log_path);
        log.info(format!("run {} started for tier {}", run_id, tier.name));

        self.run_pipeline(tier, run_id, &log, &mut report).await;

        RunMarker::clear(layout, &tier.name);
        report.finish();

        for warning in &report.warnings {
            log.warn(warning);
        }
        for error in &report.errors {
            log.error(error);
        }
        log.info(format!(
            "run finished status={} duration_ms={}",
            report.status.as_str(),
            report.duration_ms
        ));
        report
    }

    async fn run_pipeline(&self, tier: &BackupTier, run_id: &str, log: &Arc<RunLog>, report: &mut RunReport) {
        let layout = &self.ctx.layout;
        let revision = capture_revision(self.ctx.config.revision_dir.as_deref()).await;

        let mut session = self.ctx.hook_runner().session(&tier.name, run_id, log.clone());
        let mut resolved = Vec::new();
        let mut skipped = Vec::new();
        let mut abort = None;

        for source in &tier.sources {
            let outcome = session.run_pre(source).await;
            debug!(tier = %tier.name, source = %source.name, ?outcome, "Pre-hook finished");

            let (status, reason) = match outcome {
                PreOutcome::Ready { source: ready, warnings } => {
                    for warning in warnings {
                        report.warn(format!("{}: {}", source.name, warning));
                    }
                    resolved.push(ready);
                    continue;
                }
                PreOutcome::Skipped { reason } => (SourceStatus::Skipped, reason),
                PreOutcome::Failed { reason } => (SourceStatus::Failed, reason),
            };

            if source.mandatory {
                abort = Some(format!("mandatory source {} unavailable: {}", source.name, reason));
                report.sources.push(source_report(source.name.as_str(), source.kind.label(), true, status, Some(reason)));
                break;
            }

            warn!(tier = %tier.name, source = %source.name, %reason, "Source left out of this run");
            report.warn(format!("{}: {}", source.name, reason));
            report.sources.push(source_report(&source.name, source.kind.label(), false, status, Some(reason.clone())));
            skipped.push(SourceInclusion {
                name: source.name.clone(),
                kind: source.kind.label().to_string(),
                included: false,
                mandatory: false,
                note: Some(reason),
                bytes: 0,
            });
        }

        let build = match &abort {
            Some(_) => None,
            None => {
                let request = BuildRequest {
                    label: tier.name.clone(),
                    run_id: run_id.to_string(),
                    created_at: report.started_at,
                    compression: tier.compression,
                    sources: resolved,
                    skipped,
                    revision,
                    destination: Destination::Tier,
                };
                Some(ArchiveBuilder::new(layout.clone()).build(request).await)
            }
        };

        // Post-hooks run on every path: abort, build failure or success.
        for failure in session.close().await {
            let mandatory = tier.source(&failure.source).map(|s| s.mandatory).unwrap_or(false);
            let message = format!("{}: post-hook {} failed: {}", failure.source, failure.action, failure.reason);
            if mandatory {
                report.error(message);
            } else {
                report.warn(message);
            }
        }

        if let Some(reason) = abort {
            report.error(reason);
            return;
        }

        let output = match build {
            Some(Ok(output)) => output,
            Some(Err(e)) => {
                report.error(format!("archive build failed: {}", e));
                return;
            }
            None => return,
        };

        let archive = output.archive;
        for warning in output.warnings {
            report.warn(warning);
        }
        for inclusion in &archive.metadata.sources {
            if report.sources.iter().any(|s| s.name == inclusion.name) {
                continue;
            }
            let status = if inclusion.included {
                SourceStatus::Included
            } else {
                SourceStatus::Failed
            };
            report.sources.push(SourceReport {
                name: inclusion.name.clone(),
                kind: inclusion.kind.clone(),
                mandatory: inclusion.mandatory,
                status,
                detail: inclusion.note.clone(),
                bytes: inclusion.bytes,
            });
        }
        let order = |name: &str| tier.sources.iter().position(|s| s.name == name).unwrap_or(usize::MAX);
        report.sources.sort_by_key(|s| order(&s.name));
        report.archive = Some(ArchiveSummary::from(&archive));
        log.info(format!(
            "archive {} size={} digest={}",
            archive.file_name, archive.size_bytes, archive.digest
        ));

        report.replication = self.ctx.replication().replicate(&archive).await;

        match retention::prune(layout, tier).await {
            Ok(pruned) => report.retention = Some(pruned),
            Err(e) => report.warn(format!("retention failed: {}", e)),
        }
    }
}

fn source_report(name: &str, kind: &str, mandatory: bool, status: SourceStatus, detail: Option<String>) -> SourceReport {
    SourceReport {
        name: name.to_string(),
        kind: kind.to_string(),
        mandatory,
        status,
        detail,
        bytes: 0,
    }
}

/// Current `HEAD` of the deployment checkout, if there is one.
pub async fn capture_revision(dir: Option<&Path>) -> Option<String> {
    let dir = dir?;
    let output = tokio::time::timeout(
        REVISION_TIMEOUT,
        tokio::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["rev-parse", "HEAD"])
            .kill_on_drop(true)
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        debug!(dir = %dir.display(), "No git revision available");
        return None;
    }
    let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!revision.is_empty()).then_some(revision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::verify_archive;
    use crate::replication::ReplicationResult;
    use crate::scheduler::RunStatus;
    use crate::testing::{context_with_fakes, Fakes};

    fn executor(fakes: &Fakes) -> BackupExecutor {
        BackupExecutor::new(fakes.ctx.clone())
    }

    async fn run(executor: &BackupExecutor, tier: &str) -> RunReport {
        match executor.trigger(tier).await.unwrap() {
            TriggerResult::Completed(report) => report,
            TriggerResult::Coalesced { .. } => panic!("unexpected coalesce"),
        }
    }

    #[tokio::test]
    async fn test_latest_archive_passes_integrity_check() {
        let fakes = context_with_fakes();
        let executor = executor(&fakes);

        let report = run(&executor, "critical").await;
        assert!(report.succeeded(), "{}", report.render_text());

        let latest = fakes.ctx.layout.read_latest("critical").unwrap();
        let archive = report.archive.unwrap();
        assert_eq!(latest, archive.path);
        let verified = verify_archive(&latest, Some(&archive.digest), None).unwrap();
        assert!(verified.top_level.contains("grafana-db"));
        assert!(verified.top_level.contains("dashboards"));

        // Quiesced service is back up, staging is gone, no marker left
        assert!(fakes.runtime.is_running_now("obs-grafana"));
        assert!(!fakes.ctx.layout.root().join(".staging").join(&report.run_id).exists());
        assert!(!fakes.ctx.layout.run_marker("critical").exists());

        let log = std::fs::read_to_string(report.log_path.unwrap()).unwrap();
        assert!(log.contains("INFO run finished status=succeeded"));
    }

    #[tokio::test]
    async fn test_disabled_admin_api_degrades_to_warning() {
        let fakes = context_with_fakes();
        fakes.snapshots.set_disabled(true);

        let report = run(&executor(&fakes), "bulk").await;
        assert_eq!(report.status, RunStatus::Succeeded, "{}", report.render_text());
        assert!(report.warnings.iter().any(|w| w.contains("prometheus")));

        let prometheus = report.sources.iter().find(|s| s.name == "prometheus").unwrap();
        assert_eq!(prometheus.status, SourceStatus::Skipped);

        let latest = fakes.ctx.layout.read_latest("bulk").unwrap();
        let verified = verify_archive(&latest, None, None).unwrap();
        assert!(!verified.top_level.contains("prometheus"));
        assert!(verified.top_level.contains("stack-config"));
        let meta = verified.metadata.sources.iter().find(|s| s.name == "prometheus").unwrap();
        assert!(!meta.included);
    }

    #[tokio::test]
    async fn test_mandatory_source_failure_aborts_but_runs_post_hooks() {
        let fakes = context_with_fakes();
        fakes.runtime.fail_copy_from("grafana-data");

        let report = run(&executor(&fakes), "critical").await;
        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.archive.is_none());
        assert!(fakes.ctx.layout.read_latest("critical").is_none());

        // The quiesce hook stopped grafana; the post-hook must have restarted it.
        assert!(fakes.runtime.is_running_now("obs-grafana"));
        assert_eq!(
            fakes.ctx.scheduler.state("critical").unwrap().last_outcome,
            Some(RunStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_unmounted_secondary_does_not_affect_run() {
        let fakes = context_with_fakes();

        let report = run(&executor(&fakes), "critical").await;
        assert!(report.succeeded());
        assert!(matches!(report.replication[0], ReplicationResult::Skipped { .. }));

        let latest = fakes.ctx.layout.read_latest("critical").unwrap();
        assert!(verify_archive(&latest, None, None).is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_triggers_run_once() {
        let fakes = context_with_fakes();
        let executor = executor(&fakes);

        let (a, b) = tokio::join!(executor.trigger("critical"), executor.trigger("critical"));
        let results = [a.unwrap(), b.unwrap()];
        let completed = results
            .iter()
            .filter(|r| matches!(r, TriggerResult::Completed(_)))
            .count();
        let coalesced = results
            .iter()
            .filter(|r| matches!(r, TriggerResult::Coalesced { .. }))
            .count();
        assert_eq!((completed, coalesced), (1, 1));
        assert_eq!(fakes.ctx.layout.list_archives("critical").unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_tiers_run_concurrently_without_interference() {
        let fakes = context_with_fakes();
        let executor = executor(&fakes);

        let (critical, bulk) = tokio::join!(
            {
                let executor = executor.clone();
                async move { executor.trigger("critical").await }
            },
            {
                let executor = executor.clone();
                async move { executor.trigger("bulk").await }
            }
        );

        for (tier, result) in [("critical", critical), ("bulk", bulk)] {
            let TriggerResult::Completed(report) = result.unwrap() else {
                panic!("{} coalesced", tier);
            };
            assert!(report.succeeded(), "{}", report.render_text());
            let latest = fakes.ctx.layout.read_latest(tier).unwrap();
            assert!(latest.starts_with(fakes.ctx.layout.tier_dir(tier)));
            assert_eq!(verify_archive(&latest, None, None).unwrap().metadata.tier, tier);
        }
    }

    #[tokio::test]
    async fn test_run_in_another_process_coalesces() {
        let fakes = context_with_fakes();
        let layout = &fakes.ctx.layout;
        std::fs::create_dir_all(layout.tier_dir("critical")).unwrap();
        // pid 1 is always alive
        let other = RunMarker {
            run_id: "cli-run".to_string(),
            pid: 1,
            started_at: Utc::now(),
        };
        std::fs::write(layout.run_marker("critical"), serde_json::to_vec(&other).unwrap()).unwrap();

        match executor(&fakes).trigger("critical").await.unwrap() {
            TriggerResult::Coalesced { tier, running_run } => {
                assert_eq!(tier, "critical");
                assert_eq!(running_run, "cli-run");
            }
            TriggerResult::Completed(report) => panic!("ran alongside another process: {}", report.render_text()),
        }

        let state = fakes.ctx.scheduler.state("critical").unwrap();
        assert_eq!(state.status, RunStatus::Idle);
        assert_eq!(state.last_outcome, None);
        assert_eq!(state.coalesced, 1);
        assert_eq!(RunMarker::read(layout, "critical"), Some(other));
        assert!(!layout.tier_logs_dir("critical").exists());
        assert!(fakes.runtime.calls().is_empty());

        RunMarker::clear(layout, "critical");
        assert!(run(&executor(&fakes), "critical").await.succeeded());
    }

    #[tokio::test]
    async fn test_dead_marker_is_recovered_before_run() {
        let fakes = context_with_fakes();
        let layout = &fakes.ctx.layout;
        std::fs::create_dir_all(layout.tier_dir("critical")).unwrap();
        let dead = RunMarker {
            run_id: "crashed-run".to_string(),
            pid: u32::MAX - 1,
            started_at: Utc::now(),
        };
        std::fs::write(layout.run_marker("critical"), serde_json::to_vec(&dead).unwrap()).unwrap();

        let report = run(&executor(&fakes), "critical").await;
        assert!(report.succeeded(), "{}", report.render_text());
        assert!(report.warnings.iter().any(|w| w.contains("crashed-run")));
        assert!(!layout.run_marker("critical").exists());
    }

    #[tokio::test]
    async fn test_unknown_tier_is_an_error() {
        let fakes = context_with_fakes();
        assert!(executor(&fakes).trigger("hourly").await.is_err());
    }

    #[tokio::test]
    async fn test_capture_revision_outside_repository() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(capture_revision(Some(dir.path())).await, None);
        assert_eq!(capture_revision(None).await, None);
    }
}

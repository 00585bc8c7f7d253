//! Integrity and health monitor.
//!
//! Five independent checks, aggregated to the worst severity:
//! - services: readiness endpoint (or container state) of every service
//! - staleness: age of each tier's latest archive
//! - storage: bytes used under the artifact root
//! - integrity: full verification of each latest archive, plus a parse of a
//!   sample of exported documents
//! - logs: ERROR/WARN lines in recent run logs
//!
//! The monitor only reads what backup runs publish; `latest` always points
//! at a renamed, verified file, so a run in progress is never observed.

pub mod metrics;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::verify_archive;
use crate::context::EngineContext;
use crate::fs::{calculate_total_size, write_atomic, WalkOptions};
use crate::layout::ArtifactLayout;
use crate::models::BackupTier;
use crate::retention::prune_artifacts;
use crate::utils::errors::Result;
use crate::utils::format::{format_age, format_bytes};
use crate::utils::logger::RunLogLevel;

pub const LATEST_HEALTH_FILE: &str = "latest-health.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Ok => "ok",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    /// Process exit code for monitoring integration.
    pub fn exit_code(&self) -> i32 {
        match self {
            Severity::Ok => 0,
            Severity::Warning => 1,
            Severity::Critical => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub severity: Severity,
    pub issues: Vec<String>,
}

impl CheckResult {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            severity: Severity::Ok,
            issues: Vec::new(),
        }
    }

    fn raise(&mut self, severity: Severity, issue: impl Into<String>) {
        self.severity = self.severity.max(severity);
        self.issues.push(issue.into());
    }
}

/// Per-tier facts gathered along the way; they feed the metrics file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierHealth {
    pub tier: String,
    pub archives: usize,
    pub latest: Option<String>,
    pub latest_age_secs: Option<i64>,
    pub latest_size_bytes: Option<u64>,
    pub latest_valid: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupSummary {
    pub exports_removed: usize,
    pub logs_removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub verdict: Severity,
    pub checks: Vec<CheckResult>,
    pub tiers: Vec<TierHealth>,
    pub storage_bytes: u64,
    pub log_errors: usize,
    pub log_warnings: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupSummary>,
}

impl HealthReport {
    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn issues(&self) -> Vec<String> {
        self.checks
            .iter()
            .flat_map(|c| c.issues.iter().map(move |i| format!("[{}] {}", c.name, i)))
            .collect()
    }

    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Health {} at {}",
            self.verdict.as_str().to_uppercase(),
            self.checked_at.format("%Y-%m-%d %H:%M:%SZ")
        );
        for check in &self.checks {
            let _ = writeln!(out, "  {:<10} {}", check.name, check.severity.as_str());
            for issue in &check.issues {
                let _ = writeln!(out, "    - {}", issue);
            }
        }
        for tier in &self.tiers {
            let age = tier
                .latest_age_secs
                .map(|s| format_age(chrono::Duration::seconds(s)))
                .unwrap_or_else(|| "never".to_string());
            let _ = writeln!(
                out,
                "  tier {:<8} {} archives, latest {} ago, {}",
                tier.tier,
                tier.archives,
                age,
                tier.latest_size_bytes.map(format_bytes).unwrap_or_else(|| "-".to_string())
            );
        }
        let _ = writeln!(out, "  storage    {}", format_bytes(self.storage_bytes));
        out
    }
}

pub struct HealthMonitor {
    ctx: Arc<EngineContext>,
}

impl HealthMonitor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Full monitor cycle: compute the verdict, publish it, then clean up.
    pub async fn run(&self) -> Result<HealthReport> {
        let mut report = self.check().await;

        if let Err(e) = self.publish(&report).await {
            warn!(error = %e, "Failed to write health outputs");
        }

        // After the verdict, so cleanup never changes what was reported.
        match self.cleanup().await {
            Ok(cleanup) => report.cleanup = Some(cleanup),
            Err(e) => warn!(error = %e, "Health cleanup failed"),
        }

        info!(verdict = report.verdict.as_str(), issues = report.issues().len(), "Health check finished");
        Ok(report)
    }

    /// Run the five checks. Never fails: a check that cannot run reports
    /// its own failure as an issue.
    pub async fn check(&self) -> HealthReport {
        let tiers = self.ctx.config.backup_tiers().unwrap_or_default();
        let services = self.check_services().await;

        let layout = self.ctx.layout.clone();
        let health = self.ctx.config.health.clone();
        let blocking = tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            let (staleness, integrity, tier_health) = check_tiers(&layout, &tiers, health.export_sample, now);
            let (storage, storage_bytes) = check_storage(&layout, health.storage_warn_bytes, health.storage_critical_bytes);
            let (logs, errors, warnings) = check_logs(&layout.logs_dir(), health.log_window, health.log_warn_threshold);
            (staleness, integrity, tier_health, storage, storage_bytes, logs, errors, warnings)
        })
        .await;

        let (staleness, integrity, tiers, storage, storage_bytes, logs, log_errors, log_warnings) = match blocking {
            Ok(results) => results,
            Err(e) => {
                let mut failed = CheckResult::new("integrity");
                failed.raise(Severity::Critical, format!("check task failed: {}", e));
                (
                    CheckResult::new("staleness"),
                    failed,
                    Vec::new(),
                    CheckResult::new("storage"),
                    0,
                    CheckResult::new("logs"),
                    0,
                    0,
                )
            }
        };

        let checks = vec![services, staleness, storage, integrity, logs];
        let verdict = checks.iter().map(|c| c.severity).max().unwrap_or(Severity::Ok);

        HealthReport {
            checked_at: Utc::now(),
            verdict,
            checks,
            tiers,
            storage_bytes,
            log_errors,
            log_warnings,
            cleanup: None,
        }
    }

    async fn check_services(&self) -> CheckResult {
        let mut result = CheckResult::new("services");

        for (name, service) in &self.ctx.config.services {
            let reachable = match &service.readiness_url {
                Some(url) => match self.ctx.http.get(url).send().await {
                    Ok(response) if response.status().is_success() => Ok(()),
                    Ok(response) => Err(format!("{} returned {}", url, response.status())),
                    Err(e) => Err(format!("{} unreachable: {}", url, e)),
                },
                None => match self.ctx.runtime.is_running(&service.container).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(format!("container {} is not running", service.container)),
                    Err(e) => Err(e.to_string()),
                },
            };

            if let Err(reason) = reachable {
                let severity = if service.critical {
                    Severity::Critical
                } else {
                    Severity::Warning
                };
                debug!(service = %name, %reason, "Service check failed");
                result.raise(severity, format!("{}: {}", name, reason));
            }
        }
        result
    }

    async fn publish(&self, report: &HealthReport) -> Result<()> {
        let metrics_file = self.ctx.config.metrics_file();
        let json_file = self.ctx.layout.health_dir().join(LATEST_HEALTH_FILE);
        let metrics = metrics::render(report);
        let json = serde_json::to_vec_pretty(report)?;

        tokio::task::spawn_blocking(move || {
            write_atomic(&metrics_file, metrics.as_bytes())?;
            write_atomic(&json_file, &json)
        })
        .await??;
        Ok(())
    }

    /// Remove exports and run logs past their tier's retention.
    async fn cleanup(&self) -> Result<CleanupSummary> {
        let layout = self.ctx.layout.clone();
        let tiers = self.ctx.config.backup_tiers()?;

        tokio::task::spawn_blocking(move || {
            let mut summary = CleanupSummary::default();
            for tier in &tiers {
                let cutoff = SystemTime::now()
                    .checked_sub(tier.retention)
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                summary.exports_removed += prune_artifacts(&layout.tier_exports_dir(&tier.name), cutoff)?;
                summary.logs_removed += prune_artifacts(&layout.tier_logs_dir(&tier.name), cutoff)?;
            }
            Ok(summary)
        })
        .await?
    }

    /// Last published report, if any.
    pub fn read_latest(layout: &ArtifactLayout) -> Option<serde_json::Value> {
        let content = std::fs::read(layout.health_dir().join(LATEST_HEALTH_FILE)).ok()?;
        serde_json::from_slice(&content).ok()
    }
}

fn check_tiers(
    layout: &ArtifactLayout,
    tiers: &[BackupTier],
    export_sample: usize,
    now: DateTime<Utc>,
) -> (CheckResult, CheckResult, Vec<TierHealth>) {
    let mut staleness = CheckResult::new("staleness");
    let mut integrity = CheckResult::new("integrity");
    let mut tier_health = Vec::with_capacity(tiers.len());

    for tier in tiers {
        let mut health = TierHealth {
            tier: tier.name.clone(),
            archives: ArtifactLayout::archive_paths(&layout.tier_dir(&tier.name))
                .map(|p| p.len())
                .unwrap_or(0),
            ..Default::default()
        };

        let Some(latest) = layout.read_latest(&tier.name) else {
            staleness.raise(Severity::Critical, format!("{}: no archive", tier.name));
            tier_health.push(health);
            continue;
        };
        health.latest = latest.file_name().map(|n| n.to_string_lossy().to_string());

        match ArtifactLayout::load_archive(&latest) {
            Ok(archive) => {
                let age = archive.age(now);
                health.latest_age_secs = Some(age.num_seconds());
                health.latest_size_bytes = Some(archive.size_bytes);

                let warn_after = chrono::Duration::from_std(tier.warn_after).unwrap_or(chrono::Duration::MAX);
                let critical_after = chrono::Duration::from_std(tier.critical_after).unwrap_or(chrono::Duration::MAX);
                if age > critical_after {
                    staleness.raise(Severity::Critical, format!("{}: latest archive is {} old", tier.name, format_age(age)));
                } else if age > warn_after {
                    staleness.raise(Severity::Warning, format!("{}: latest archive is {} old", tier.name, format_age(age)));
                }

                match verify_archive(&latest, Some(&archive.digest), None) {
                    Ok(_) => health.latest_valid = true,
                    Err(e) => integrity.raise(Severity::Critical, format!("{}: {}", tier.name, e)),
                }
            }
            Err(e) => {
                staleness.raise(Severity::Critical, format!("{}: latest archive unreadable", tier.name));
                integrity.raise(Severity::Critical, format!("{}: {}", tier.name, e));
            }
        }

        for issue in sample_exports(&layout.tier_exports_dir(&tier.name), export_sample) {
            integrity.raise(Severity::Warning, format!("{}: {}", tier.name, issue));
        }

        tier_health.push(health);
    }

    (staleness, integrity, tier_health)
}

/// Parse up to `limit` documents of the newest export run.
fn sample_exports(tier_exports: &Path, limit: usize) -> Vec<String> {
    let newest_run = std::fs::read_dir(tier_exports)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| Some((e.metadata().ok()?.modified().ok()?, e.path())))
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path);

    let Some(run_dir) = newest_run else {
        return Vec::new();
    };

    WalkDir::new(&run_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.path().extension().is_some_and(|x| x == "json"))
        .take(limit)
        .filter_map(|e| {
            let parsed = std::fs::read(e.path())
                .map_err(|err| err.to_string())
                .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).map_err(|err| err.to_string()));
            parsed
                .err()
                .map(|reason| format!("invalid export {}: {}", e.path().display(), reason))
        })
        .collect()
}

fn check_storage(layout: &ArtifactLayout, warn_bytes: u64, critical_bytes: Option<u64>) -> (CheckResult, u64) {
    let mut result = CheckResult::new("storage");
    let used = if layout.root().exists() {
        match calculate_total_size(layout.root(), &WalkOptions::default()) {
            Ok(used) => used,
            Err(e) => {
                result.raise(Severity::Warning, format!("cannot measure {}: {}", layout.root().display(), e));
                return (result, 0);
            }
        }
    } else {
        0
    };

    if critical_bytes.is_some_and(|limit| used >= limit) {
        result.raise(Severity::Critical, format!("{} used", format_bytes(used)));
    } else if used >= warn_bytes {
        result.raise(Severity::Warning, format!("{} used (threshold {})", format_bytes(used), format_bytes(warn_bytes)));
    }
    (result, used)
}

/// Count ERROR and WARN lines in run logs modified within `window`. The log
/// check never goes beyond a warning; errors behind it already surfaced as
/// failed runs and stale archives.
fn check_logs(logs_dir: &Path, window: Duration, warn_threshold: usize) -> (CheckResult, usize, usize) {
    let mut result = CheckResult::new("logs");
    let since = SystemTime::now().checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
    let mut errors = 0;
    let mut warnings = 0;

    let recent = WalkDir::new(logs_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.path().extension().is_some_and(|x| x == "log"))
        .filter(|e| {
            e.metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .is_some_and(|modified| modified >= since)
        })
        .map(|e| e.into_path())
        .collect::<Vec<PathBuf>>();

    for path in recent {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        for line in content.lines() {
            match line.split_whitespace().nth(1) {
                Some(level) if level == RunLogLevel::Error.as_str() => errors += 1,
                Some(level) if level == RunLogLevel::Warn.as_str() => warnings += 1,
                _ => {}
            }
        }
    }

    if errors > 0 {
        result.raise(Severity::Warning, format!("{} error lines in recent run logs", errors));
    }
    if warnings > warn_threshold {
        result.raise(
            Severity::Warning,
            format!("{} warning lines in recent run logs (threshold {})", warnings, warn_threshold),
        );
    }
    (result, errors, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{BackupExecutor, TriggerResult};
    use crate::testing::context_with_fakes;
    use std::io::Write as _;

    #[test]
    fn test_severity_order_and_exit_codes() {
        assert!(Severity::Ok < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
        assert_eq!(Severity::Critical.exit_code(), 2);
        assert_eq!(
            [Severity::Warning, Severity::Critical, Severity::Ok].into_iter().max(),
            Some(Severity::Critical)
        );
    }

    #[tokio::test]
    async fn test_no_archives_is_critical() {
        let fakes = context_with_fakes();
        let report = HealthMonitor::new(fakes.ctx.clone()).check().await;

        assert_eq!(report.verdict, Severity::Critical);
        assert_eq!(report.check("staleness").unwrap().severity, Severity::Critical);
        assert_eq!(report.check("services").unwrap().severity, Severity::Ok);
        assert_eq!(report.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_fresh_backups_are_healthy() {
        let fakes = context_with_fakes();
        let executor = BackupExecutor::new(fakes.ctx.clone());
        for tier in ["critical", "bulk"] {
            let TriggerResult::Completed(report) = executor.trigger(tier).await.unwrap() else {
                panic!("coalesced");
            };
            assert!(report.succeeded(), "{}", report.render_text());
        }

        let monitor = HealthMonitor::new(fakes.ctx.clone());
        let report = monitor.run().await.unwrap();
        assert_eq!(report.verdict, Severity::Ok, "{}", report.render_text());
        assert!(report.tiers.iter().all(|t| t.latest_valid));

        let metrics = std::fs::read_to_string(fakes.ctx.config.metrics_file()).unwrap();
        assert!(metrics.contains("obs_backup_health_verdict 0"));
        let json = HealthMonitor::read_latest(&fakes.ctx.layout).unwrap();
        assert_eq!(json["verdict"], "ok");
    }

    #[tokio::test]
    async fn test_truncated_archive_is_critical() {
        let fakes = context_with_fakes();
        let executor = BackupExecutor::new(fakes.ctx.clone());
        executor.trigger("critical").await.unwrap();
        executor.trigger("bulk").await.unwrap();

        let latest = fakes.ctx.layout.read_latest("critical").unwrap();
        let len = std::fs::metadata(&latest).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&latest).unwrap();
        file.set_len(len.saturating_sub(100)).unwrap();

        let report = HealthMonitor::new(fakes.ctx.clone()).check().await;
        let integrity = report.check("integrity").unwrap();
        assert_eq!(integrity.severity, Severity::Critical);
        assert!(integrity.issues[0].starts_with("critical:"));
        assert_eq!(report.verdict, Severity::Critical);
    }

    #[tokio::test]
    async fn test_stopped_critical_service_is_critical() {
        let fakes = context_with_fakes();
        fakes.runtime.set_running("obs-prometheus", false);

        let report = HealthMonitor::new(fakes.ctx.clone()).check().await;
        let services = report.check("services").unwrap();
        assert_eq!(services.severity, Severity::Critical);
        assert!(services.issues[0].contains("obs-prometheus"));
    }

    #[test]
    fn test_log_check_counts_levels() {
        let dir = tempfile::TempDir::new().unwrap();
        let tier_logs = dir.path().join("critical");
        std::fs::create_dir_all(&tier_logs).unwrap();
        let mut file = std::fs::File::create(tier_logs.join("run.log")).unwrap();
        writeln!(file, "2026-10-19T02:00:00Z INFO run started").unwrap();
        writeln!(file, "2026-10-19T02:00:01Z WARN source=prometheus snapshot skipped").unwrap();
        writeln!(file, "2026-10-19T02:00:02Z WARN slow copy").unwrap();

        let (result, errors, warnings) = check_logs(dir.path(), Duration::from_secs(3600), 1);
        assert_eq!((errors, warnings), (0, 2));
        assert_eq!(result.severity, Severity::Warning);

        writeln!(file, "2026-10-19T02:00:03Z ERROR mandatory source failed").unwrap();
        let (result, errors, _) = check_logs(dir.path(), Duration::from_secs(3600), 10);
        assert_eq!(errors, 1);
        assert_eq!(result.severity, Severity::Warning);

        let (result, _, _) = check_logs(&dir.path().join("missing"), Duration::from_secs(3600), 10);
        assert_eq!(result.severity, Severity::Ok);
    }

    #[test]
    fn test_invalid_export_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let run = dir.path().join("run-1/dashboards");
        std::fs::create_dir_all(&run).unwrap();
        std::fs::write(run.join("ok.json"), b"{\"dashboard\":{}}").unwrap();
        std::fs::write(run.join("broken.json"), b"{\"dashboard\":").unwrap();

        let issues = sample_exports(dir.path(), 10);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("broken.json"));
        assert!(sample_exports(&dir.path().join("missing"), 10).is_empty());
    }

    #[test]
    fn test_storage_thresholds() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 2048]).unwrap();
        let layout = ArtifactLayout::new(dir.path());

        let (ok, used) = check_storage(&layout, 4096, None);
        assert_eq!(used, 2048);
        assert_eq!(ok.severity, Severity::Ok);
        assert_eq!(check_storage(&layout, 1024, None).0.severity, Severity::Warning);
        assert_eq!(check_storage(&layout, 1024, Some(2000)).0.severity, Severity::Critical);
    }
}

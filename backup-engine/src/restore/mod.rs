//! Restore coordinator.
//!
//! Steps, in order (a dry run stops after extraction and mutates nothing):
//! 1. resolve and fully verify the archive; nothing live is touched before
//!    this passes
//! 2. confirm (skipped with `force`)
//! 3. extract the in-scope entries to staging
//! 4. stop the owning services, under the live-state lock
//! 5. copy current live state into a safety archive
//! 6. replace live state, fix ownership
//! 7. restart services and wait for readiness (degraded, not failed, on
//!    timeout)
//! 8. import configuration documents item by item
//!
//! Each completed step is checkpointed next to the safety copy.

pub mod config_import;
pub mod state;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::adapters::config_api::export_items;
use crate::archive::{extract_entries, verify_archive, ArchiveBuilder, BuildRequest, Destination, ResolvedSource};
use crate::config::{RestoreKind, RestoreTargetConfig, ServiceConfig};
use crate::context::EngineContext;
use crate::fs::{clear_dir, copy_tree, Ownership};
use crate::layout::ArtifactLayout;
use crate::models::{CompressionMode, ExportKind};
use crate::utils::errors::{ArchiveError, EngineError, RestoreError};
use crate::utils::format::format_duration_ms;

use config_import::{collect_documents, import_tree};
use state::{Checkpoint, RestoreStep};

/// Which archive to restore from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveRef {
    /// Any archive file, including a safety copy.
    Path(PathBuf),
    /// The tier's latest pointer.
    Latest { tier: String },
}

#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub archive: ArchiveRef,
    /// Restore target names; empty means every target the archive covers.
    pub scopes: Vec<String>,
    pub force: bool,
    pub dry_run: bool,
}

/// Operator confirmation before live state is replaced.
pub trait Confirmer: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Confirms everything (`--force`, daemon-less automation).
pub struct AssumeYes;

impl Confirmer for AssumeYes {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// Dry run: what would happen.
    Planned,
    Restored,
    /// Data replaced but readiness, or some config items, not confirmed.
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    pub scope: String,
    pub kind: RestoreKind,
    pub status: TargetStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub restored_items: usize,
    pub failed_items: usize,
}

impl TargetOutcome {
    fn new(scope: &str, kind: RestoreKind, status: TargetStatus) -> Self {
        Self {
            scope: scope.to_string(),
            kind,
            status,
            detail: None,
            restored_items: 0,
            failed_items: 0,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub run_id: String,
    pub archive: PathBuf,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Safety archive of the replaced live state; restorable like any archive.
    pub safety_copy: Option<PathBuf>,
    /// Config documents exported before importing over them.
    pub safety_export: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub targets: Vec<TargetOutcome>,
    pub warnings: Vec<String>,
}

impl RestoreReport {
    pub fn succeeded(&self) -> bool {
        self.targets.iter().all(|t| t.status != TargetStatus::Failed)
    }

    pub fn target(&self, scope: &str) -> Option<&TargetOutcome> {
        self.targets.iter().find(|t| t.scope == scope)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Restore{} from {} in {}",
            if self.dry_run { " (dry run)" } else { "" },
            self.archive.display(),
            format_duration_ms(self.duration_ms)
        );
        for target in &self.targets {
            let _ = write!(out, "  {:<12} {:?}", target.scope, target.status);
            if target.kind == RestoreKind::ConfigImport {
                let _ = write!(out, " ({} restored, {} failed)", target.restored_items, target.failed_items);
            }
            let _ = writeln!(out);
            if let Some(detail) = &target.detail {
                let _ = writeln!(out, "      {}", detail);
            }
        }
        if let Some(path) = &self.safety_copy {
            let _ = writeln!(out, "  safety copy  {}", path.display());
        }
        if let Some(path) = &self.safety_export {
            let _ = writeln!(out, "  config copy  {}", path.display());
        }
        for warning in &self.warnings {
            let _ = writeln!(out, "  warning      {}", warning);
        }
        out
    }
}

/// Removes a staging directory on every exit path.
struct StagingDir(PathBuf);

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.0.display(), error = %e, "Failed to remove restore staging");
            }
        }
    }
}

/// A service owning one or more live targets.
struct OwnedService {
    name: String,
    container: String,
    config: ServiceConfig,
}

pub struct RestoreCoordinator {
    ctx: Arc<EngineContext>,
}

impl RestoreCoordinator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn restore(&self, plan: &RestorePlan, confirmer: &dyn Confirmer) -> Result<RestoreReport, RestoreError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let layout = &self.ctx.layout;

        // 1. Verify before anything else.
        let archive_path = self.resolve(&plan.archive)?;
        let verify_path = archive_path.clone();
        let verified = tokio::task::spawn_blocking(move || {
            let expected_digest = ArtifactLayout::load_sidecar(&verify_path).map(|a| a.digest);
            verify_archive(&verify_path, expected_digest.as_deref(), None)
        })
        .await
        .map_err(EngineError::from)?
        .map_err(|e| integrity_failure(&archive_path, e))?;

        let targets = self.select_targets(&plan.scopes, &verified.top_level, &archive_path)?;
        let scopes: Vec<String> = targets.iter().map(|(scope, _)| scope.clone()).collect();
        let mut checkpoint = Checkpoint::new(&run_id, &archive_path, &scopes, plan.dry_run);
        checkpoint.complete(RestoreStep::Verified);
        info!(%run_id, archive = %archive_path.display(), ?scopes, dry_run = plan.dry_run, "Restore verified archive");

        let services = self.owned_services(&targets)?;

        // 2. Confirm.
        if !plan.force && !plan.dry_run {
            let containers: Vec<&str> = services.iter().map(|s| s.container.as_str()).collect();
            let prompt = format!(
                "Restore {} from {}? Services to restart: {}",
                scopes.join(", "),
                archive_path.display(),
                if containers.is_empty() { "none".to_string() } else { containers.join(", ") }
            );
            if !confirmer.confirm(&prompt) {
                return Err(RestoreError::Aborted);
            }
        }
        checkpoint.complete(RestoreStep::Confirmed);

        // 3. Extract.
        let staging = StagingDir(layout.staging_dir(&format!("restore-{}", run_id)));
        let names: BTreeSet<String> = targets.iter().map(|(_, t)| t.source.clone()).collect();
        let (extract_from, extract_to) = (archive_path.clone(), staging.0.clone());
        tokio::task::spawn_blocking(move || extract_entries(&extract_from, &names, &extract_to))
            .await
            .map_err(EngineError::from)?
            .map_err(|e| integrity_failure(&archive_path, e))?;
        checkpoint.complete(RestoreStep::Extracted);

        let mut report = RestoreReport {
            run_id: run_id.clone(),
            archive: archive_path.clone(),
            dry_run: plan.dry_run,
            started_at,
            duration_ms: 0,
            safety_copy: None,
            safety_export: None,
            state_file: None,
            targets: Vec::new(),
            warnings: Vec::new(),
        };

        if plan.dry_run {
            report.targets = self.plan_targets(&targets, &staging.0);
            checkpoint.complete(RestoreStep::Completed);
            report.duration_ms = elapsed_ms(started_at);
            return Ok(report);
        }

        let live: Vec<&(String, RestoreTargetConfig)> =
            targets.iter().filter(|(_, t)| t.kind == RestoreKind::Live).collect();
        let imports: Vec<&(String, RestoreTargetConfig)> =
            targets.iter().filter(|(_, t)| t.kind == RestoreKind::ConfigImport).collect();

        let safety_run = self
            .ctx
            .config
            .safety_dir()
            .join(format!("{}-{}", started_at.format("%Y%m%dT%H%M%SZ"), &run_id[..8]));
        std::fs::create_dir_all(&safety_run)?;
        checkpoint.attach(&safety_run);
        report.state_file = checkpoint.path().map(Path::to_path_buf);

        let lock_guard = if live.is_empty() {
            None
        } else {
            Some(self.ctx.live_lock().acquire(&format!("restore:{}", run_id)).await?)
        };

        // 4. Stop owning services.
        for service in &services {
            let stop = async {
                if self.ctx.runtime.is_running(&service.container).await? {
                    self.ctx.runtime.stop(&service.container).await?;
                    info!(service = %service.name, "Stopped for restore");
                }
                Ok::<_, EngineError>(())
            };
            if let Err(e) = stop.await {
                checkpoint.fail(format!("stopping {} failed: {}", service.name, e));
                self.start_all(&services).await;
                return Err(e.into());
            }
        }
        checkpoint.complete(RestoreStep::ServicesStopped);

        // 5. Safety copy of current state.
        let safety_label = |path: &Option<PathBuf>| {
            path.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        };
        if !live.is_empty() {
            match self.capture_safety_copy(&run_id, &live, &safety_run).await {
                Ok(path) => {
                    checkpoint.set_safety_copy(&path);
                    report.safety_copy = Some(path);
                }
                Err(reason) => {
                    error!(%run_id, %reason, "Safety copy failed, live state left untouched");
                    checkpoint.fail(format!("safety copy failed: {}", reason));
                    self.start_all(&services).await;
                    return Err(RestoreError::ReplaceFailed {
                        target: live[0].0.clone(),
                        reason: format!("safety copy failed: {}", reason),
                        safety_copy: "none".to_string(),
                    });
                }
            }
        }
        if !imports.is_empty() {
            if let Some(api) = &self.ctx.config_api {
                let dest = safety_run.join("config-export");
                match export_items(api.as_ref(), &ExportKind::ALL, &dest).await {
                    Ok(summary) if summary.failed > 0 => {
                        report.warnings.push(format!("config safety export incomplete: {} items failed", summary.failed));
                        report.safety_export = Some(dest);
                    }
                    Ok(_) => report.safety_export = Some(dest),
                    Err(e) => report.warnings.push(format!("config safety export failed: {}", e)),
                }
            }
        }
        checkpoint.complete(RestoreStep::SafetyCopied);

        // 6. Replace.
        let safety_copy = safety_label(&report.safety_copy);
        for (scope, target) in &live {
            let source = staging.0.join(&target.source);
            match self.replace(target, &source).await {
                Ok(()) => {
                    info!(%scope, "Live state replaced");
                    report.targets.push(TargetOutcome::new(scope, RestoreKind::Live, TargetStatus::Restored));
                }
                Err(reason) => {
                    error!(%scope, %reason, "Replacing live state failed");
                    checkpoint.fail(format!("{}: {}", scope, reason));
                    report.targets.push(
                        TargetOutcome::new(scope, RestoreKind::Live, TargetStatus::Failed)
                            .with_detail(format!("{}; restore the safety copy {}", reason, safety_copy)),
                    );
                }
            }
        }
        checkpoint.complete(RestoreStep::Replaced);

        // 7. Restart and wait for readiness.
        let mut restart_failure = None;
        for service in &services {
            if let Err(e) = self.ctx.runtime.start(&service.container).await {
                error!(service = %service.name, error = %e, "Restart after restore failed");
                self.mark_service(&mut report, service, TargetStatus::Failed, format!("restart failed: {}", e));
                restart_failure.get_or_insert((service.container.clone(), e.to_string()));
                continue;
            }
            if !self.wait_ready(service).await {
                let detail = format!(
                    "{} not ready within {}s; it may still converge",
                    service.name,
                    self.ctx.config.restore.readiness_timeout.as_secs()
                );
                warn!(service = %service.name, "Readiness not observed after restore");
                report.warnings.push(detail.clone());
                self.mark_service(&mut report, service, TargetStatus::Degraded, detail);
            }
        }
        drop(lock_guard);
        checkpoint.complete(RestoreStep::ServicesRestarted);

        // 8. Configuration documents.
        for (scope, target) in &imports {
            let outcome = match &self.ctx.config_api {
                Some(api) => match import_tree(api.as_ref(), &staging.0.join(&target.source)).await {
                    Ok(summary) => {
                        let status = match (summary.restored, summary.failed) {
                            (_, 0) => TargetStatus::Restored,
                            (0, _) => TargetStatus::Failed,
                            _ => TargetStatus::Degraded,
                        };
                        let mut outcome = TargetOutcome::new(scope, RestoreKind::ConfigImport, status);
                        outcome.restored_items = summary.restored;
                        outcome.failed_items = summary.failed;
                        if !summary.errors.is_empty() {
                            outcome.detail = Some(summary.errors.join("; "));
                        }
                        outcome
                    }
                    Err(e) => TargetOutcome::new(scope, RestoreKind::ConfigImport, TargetStatus::Failed)
                        .with_detail(e.to_string()),
                },
                None => TargetOutcome::new(scope, RestoreKind::ConfigImport, TargetStatus::Failed)
                    .with_detail("no config API configured"),
            };
            info!(%scope, restored = outcome.restored_items, failed = outcome.failed_items, "Configuration imported");
            report.targets.push(outcome);
        }
        checkpoint.complete(RestoreStep::ConfigImported);

        report.duration_ms = elapsed_ms(started_at);

        if let Some((service, reason)) = restart_failure {
            checkpoint.fail(format!("restart of {} failed: {}", service, reason));
            return Err(RestoreError::ServiceRestartFailed {
                service,
                reason,
                safety_copy: safety_label(&report.safety_copy),
            });
        }

        checkpoint.complete(RestoreStep::Completed);
        info!(%run_id, succeeded = report.succeeded(), "Restore finished");
        Ok(report)
    }

    fn resolve(&self, archive: &ArchiveRef) -> Result<PathBuf, RestoreError> {
        match archive {
            ArchiveRef::Path(path) if path.is_file() => Ok(path.clone()),
            ArchiveRef::Path(path) => Err(RestoreError::ArchiveNotFound(path.display().to_string())),
            ArchiveRef::Latest { tier } => {
                self.ctx.config.tier(tier)?;
                self.ctx
                    .layout
                    .read_latest(tier)
                    .ok_or_else(|| RestoreError::ArchiveNotFound(format!("tier {} has no latest archive", tier)))
            }
        }
    }

    fn select_targets(
        &self,
        scopes: &[String],
        entries: &BTreeSet<String>,
        archive: &Path,
    ) -> Result<Vec<(String, RestoreTargetConfig)>, RestoreError> {
        let configured = &self.ctx.config.restore.targets;

        if scopes.is_empty() {
            let covered: Vec<_> = configured
                .iter()
                .filter(|(_, t)| entries.contains(&t.source))
                .map(|(scope, t)| (scope.clone(), t.clone()))
                .collect();
            if covered.is_empty() {
                return Err(RestoreError::UnknownScope(format!(
                    "(none of the configured targets is in {})",
                    archive.display()
                )));
            }
            return Ok(covered);
        }

        let mut selected = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let target = configured
                .get(scope)
                .ok_or_else(|| RestoreError::UnknownScope(scope.clone()))?;
            if !entries.contains(&target.source) {
                return Err(RestoreError::IntegrityCheckFailed {
                    path: archive.to_path_buf(),
                    reason: format!("archive has no `{}` entry for scope {}", target.source, scope),
                });
            }
            if !selected.iter().any(|(s, _): &(String, RestoreTargetConfig)| s == scope) {
                selected.push((scope.clone(), target.clone()));
            }
        }
        Ok(selected)
    }

    fn owned_services(&self, targets: &[(String, RestoreTargetConfig)]) -> Result<Vec<OwnedService>, RestoreError> {
        let mut services: Vec<OwnedService> = Vec::new();
        for (_, target) in targets.iter().filter(|(_, t)| t.kind == RestoreKind::Live) {
            let Some(name) = &target.service else {
                continue;
            };
            if services.iter().any(|s| &s.name == name) {
                continue;
            }
            let config = self
                .ctx
                .config
                .services
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::Config(format!("unknown service `{}`", name)))?;
            services.push(OwnedService {
                name: name.clone(),
                container: config.container.clone(),
                config,
            });
        }
        Ok(services)
    }

    fn plan_targets(&self, targets: &[(String, RestoreTargetConfig)], staging: &Path) -> Vec<TargetOutcome> {
        targets
            .iter()
            .map(|(scope, target)| match target.kind {
                RestoreKind::Live => {
                    let location = match (&target.volume, &target.path) {
                        (Some(volume), _) => format!("volume {}", volume),
                        (None, Some(path)) => path.display().to_string(),
                        (None, None) => "nothing".to_string(),
                    };
                    let mut detail = format!("would replace {} with entry {}", location, target.source);
                    if let Some(service) = &target.service {
                        let _ = write!(detail, ", stopping and restarting {}", service);
                    }
                    if let Some(owner) = &target.owner {
                        let _ = write!(detail, ", owned by {}", owner);
                    }
                    TargetOutcome::new(scope, RestoreKind::Live, TargetStatus::Planned).with_detail(detail)
                }
                RestoreKind::ConfigImport => {
                    let documents = collect_documents(&staging.join(&target.source))
                        .map(|groups| groups.iter().map(|(_, files)| files.len()).sum::<usize>())
                        .unwrap_or(0);
                    let mut outcome = TargetOutcome::new(scope, RestoreKind::ConfigImport, TargetStatus::Planned)
                        .with_detail(format!("would import {} documents", documents));
                    outcome.restored_items = documents;
                    outcome
                }
            })
            .collect()
    }

    /// Copy the current state of every live target and pack it as a
    /// detached archive under `safety_run`.
    async fn capture_safety_copy(
        &self,
        run_id: &str,
        live: &[&(String, RestoreTargetConfig)],
        safety_run: &Path,
    ) -> Result<PathBuf, String> {
        let capture = StagingDir(self.ctx.layout.staging_dir(&format!("safety-{}", run_id)));
        let mut sources = Vec::with_capacity(live.len());

        for (_, target) in live {
            let dest = capture.0.join(&target.source);
            if let Some(volume) = &target.volume {
                self.ctx
                    .runtime
                    .copy_from_volume(volume, None, &dest)
                    .await
                    .map_err(|e| e.to_string())?;
            } else if let Some(path) = target.path.clone() {
                let copy_to = dest.clone();
                tokio::task::spawn_blocking(move || {
                    if path.exists() {
                        copy_tree(&path, &copy_to).map(|_| ())
                    } else {
                        std::fs::create_dir_all(&copy_to)
                    }
                })
                .await
                .map_err(|e| e.to_string())?
                .map_err(|e| e.to_string())?;
            }
            sources.push(ResolvedSource {
                name: target.source.clone(),
                kind: "safety".to_string(),
                root: dest,
                mandatory: true,
                exclude: Vec::new(),
            });
        }

        let output = ArchiveBuilder::new(self.ctx.layout.clone())
            .build(BuildRequest {
                label: "safety".to_string(),
                run_id: run_id.to_string(),
                created_at: Utc::now(),
                compression: CompressionMode::Fast,
                sources,
                skipped: Vec::new(),
                revision: None,
                destination: Destination::Detached {
                    dir: safety_run.to_path_buf(),
                },
            })
            .await
            .map_err(|e| e.to_string())?;

        info!(path = %output.archive.path.display(), "Safety copy written");
        Ok(output.archive.path)
    }

    async fn replace(&self, target: &RestoreTargetConfig, source: &Path) -> Result<(), String> {
        if let Some(volume) = &target.volume {
            let runtime = &self.ctx.runtime;
            runtime.clear_volume(volume).await.map_err(|e| e.to_string())?;
            runtime.copy_into_volume(source, volume).await.map_err(|e| e.to_string())?;
            if let Some(owner) = &target.owner {
                runtime.chown_volume(volume, owner).await.map_err(|e| e.to_string())?;
            }
            return Ok(());
        }

        let Some(path) = target.path.clone() else {
            return Err("target has neither volume nor path".to_string());
        };
        let owner = target.owner.clone();
        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || {
            if source.is_dir() {
                clear_dir(&path)?;
            }
            copy_tree(&source, &path)?;
            if let Some(owner) = owner {
                Ownership::parse(&owner)?.apply_recursive(&path)?;
            }
            Ok::<_, EngineError>(())
        })
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())
    }

    async fn start_all(&self, services: &[OwnedService]) {
        for service in services {
            if let Err(e) = self.ctx.runtime.start(&service.container).await {
                warn!(service = %service.name, error = %e, "Failed to restart service");
            }
        }
    }

    /// Poll readiness until the configured timeout. Services without a
    /// readiness URL count as ready once their container runs.
    async fn wait_ready(&self, service: &OwnedService) -> bool {
        let restore = &self.ctx.config.restore;
        let deadline = Instant::now() + restore.readiness_timeout;
        loop {
            let ready = match &service.config.readiness_url {
                Some(url) => self
                    .ctx
                    .http
                    .get(url)
                    .send()
                    .await
                    .map(|r| r.status().is_success())
                    .unwrap_or(false),
                None => self.ctx.runtime.is_running(&service.container).await.unwrap_or(false),
            };
            if ready {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(restore.poll_interval).await;
        }
    }

    fn mark_service(&self, report: &mut RestoreReport, service: &OwnedService, status: TargetStatus, detail: String) {
        let owned: Vec<&String> = self
            .ctx
            .config
            .restore
            .targets
            .iter()
            .filter(|(_, t)| t.service.as_deref() == Some(service.name.as_str()))
            .map(|(scope, _)| scope)
            .collect();

        for outcome in report.targets.iter_mut().filter(|t| owned.contains(&&t.scope)) {
            // A failed replace stays failed.
            if outcome.status == TargetStatus::Restored || status == TargetStatus::Failed {
                outcome.status = status;
                outcome.detail = Some(detail.clone());
            }
        }
    }
}

fn integrity_failure(archive: &Path, error: ArchiveError) -> RestoreError {
    match error {
        ArchiveError::IntegrityCheckFailed { path, reason } => RestoreError::IntegrityCheckFailed { path, reason },
        other => RestoreError::IntegrityCheckFailed {
            path: archive.to_path_buf(),
            reason: other.to_string(),
        },
    }
}

fn elapsed_ms(started_at: DateTime<Utc>) -> u64 {
    (Utc::now() - started_at).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{BackupExecutor, TriggerResult};
    use crate::testing::{context_with_fakes, Fakes, RuntimeCall};

    struct Decline;

    impl Confirmer for Decline {
        fn confirm(&self, _prompt: &str) -> bool {
            false
        }
    }

    async fn backed_up() -> Fakes {
        let fakes = context_with_fakes();
        let TriggerResult::Completed(report) = BackupExecutor::new(fakes.ctx.clone()).trigger("critical").await.unwrap()
        else {
            panic!("coalesced");
        };
        assert!(report.succeeded(), "{}", report.render_text());
        fakes
    }

    fn plan(scopes: &[&str], dry_run: bool) -> RestorePlan {
        RestorePlan {
            archive: ArchiveRef::Latest {
                tier: "critical".to_string(),
            },
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            force: true,
            dry_run,
        }
    }

    fn live_db(fakes: &Fakes) -> String {
        std::fs::read_to_string(fakes.runtime.volume_path("grafana-data").join("grafana.db")).unwrap()
    }

    #[tokio::test]
    async fn test_restore_datastore_on_healthy_system() {
        let fakes = backed_up().await;
        std::fs::write(fakes.runtime.volume_path("grafana-data").join("grafana.db"), "after-backup").unwrap();
        let calls_before = fakes.runtime.calls().len();

        let coordinator = RestoreCoordinator::new(fakes.ctx.clone());
        let report = coordinator.restore(&plan(&["datastore"], false), &AssumeYes).await.unwrap();

        assert_eq!(report.target("datastore").unwrap().status, TargetStatus::Restored, "{}", report.render_text());
        assert_eq!(live_db(&fakes), "sqlite");
        assert!(fakes.runtime.is_running_now("obs-grafana"));

        let calls = fakes.runtime.calls()[calls_before..].to_vec();
        let stop = calls.iter().position(|c| *c == RuntimeCall::Stop("obs-grafana".to_string())).unwrap();
        let start = calls.iter().position(|c| *c == RuntimeCall::Start("obs-grafana".to_string())).unwrap();
        assert!(stop < start);
        assert!(calls.contains(&RuntimeCall::Chown("grafana-data".to_string(), "472:0".to_string())));

        // The safety copy holds the pre-restore state and is itself restorable.
        let safety = report.safety_copy.clone().unwrap();
        let verified = verify_archive(&safety, None, None).unwrap();
        assert!(verified.top_level.contains("grafana-db"));
        let state = Checkpoint::load(report.state_file.as_ref().unwrap()).unwrap();
        assert_eq!(state.completed.last(), Some(&RestoreStep::Completed));

        let rollback = RestorePlan {
            archive: ArchiveRef::Path(safety),
            ..plan(&["datastore"], false)
        };
        coordinator.restore(&rollback, &AssumeYes).await.unwrap();
        assert_eq!(live_db(&fakes), "after-backup");
    }

    #[tokio::test]
    async fn test_dry_run_never_mutates() {
        let fakes = backed_up().await;
        std::fs::write(fakes.runtime.volume_path("grafana-data").join("grafana.db"), "live").unwrap();
        let calls_before = fakes.runtime.calls();

        let report = RestoreCoordinator::new(fakes.ctx.clone())
            .restore(&plan(&[], true), &Decline)
            .await
            .unwrap();

        assert!(report.targets.iter().all(|t| t.status == TargetStatus::Planned));
        assert_eq!(report.target("config").unwrap().restored_items, 2);
        assert_eq!(fakes.runtime.calls(), calls_before);
        assert_eq!(live_db(&fakes), "live");
        assert!(fakes.runtime.is_running_now("obs-grafana"));
        assert!(fakes.api.imported().is_empty());
        assert!(!fakes.ctx.config.safety_dir().exists());
        assert!(!fakes.ctx.layout.root().join(".staging").join(format!("restore-{}", report.run_id)).exists());
    }

    #[tokio::test]
    async fn test_corrupted_archive_aborts_before_live_state() {
        let fakes = backed_up().await;
        let latest = fakes.ctx.layout.read_latest("critical").unwrap();
        let len = std::fs::metadata(&latest).unwrap().len();
        std::fs::OpenOptions::new().write(true).open(&latest).unwrap().set_len(len - 100).unwrap();
        let calls_before = fakes.runtime.calls();

        let err = RestoreCoordinator::new(fakes.ctx.clone())
            .restore(&plan(&["datastore"], false), &AssumeYes)
            .await
            .unwrap_err();

        assert!(matches!(err, RestoreError::IntegrityCheckFailed { .. }), "{}", err);
        assert_eq!(fakes.runtime.calls(), calls_before);
        assert!(!fakes.ctx.config.safety_dir().exists());
    }

    #[tokio::test]
    async fn test_declined_confirmation_aborts() {
        let fakes = backed_up().await;
        let calls_before = fakes.runtime.calls();
        let mut unforced = plan(&["datastore"], false);
        unforced.force = false;

        let err = RestoreCoordinator::new(fakes.ctx.clone())
            .restore(&unforced, &Decline)
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::Aborted));
        assert_eq!(fakes.runtime.calls(), calls_before);
    }

    #[tokio::test]
    async fn test_config_import_reports_counts() {
        let fakes = backed_up().await;
        fakes.api.fail_import("Overview");
        let calls_before = fakes.runtime.calls();

        let report = RestoreCoordinator::new(fakes.ctx.clone())
            .restore(&plan(&["config"], false), &AssumeYes)
            .await
            .unwrap();

        let target = report.target("config").unwrap();
        assert_eq!(target.status, TargetStatus::Degraded);
        assert_eq!((target.restored_items, target.failed_items), (1, 1));
        assert!(report.safety_export.as_ref().unwrap().join("dashboards/overview.json").is_file());
        // Config-only restores leave the runtime alone
        assert_eq!(fakes.runtime.calls(), calls_before);
        assert!(report.safety_copy.is_none());
    }

    #[tokio::test]
    async fn test_restart_failure_names_safety_copy() {
        let fakes = backed_up().await;
        fakes.runtime.fail_start("obs-grafana");

        let err = RestoreCoordinator::new(fakes.ctx.clone())
            .restore(&plan(&["datastore"], false), &AssumeYes)
            .await
            .unwrap_err();

        let RestoreError::ServiceRestartFailed { service, safety_copy, .. } = err else {
            panic!("unexpected error {}", err);
        };
        assert_eq!(service, "obs-grafana");
        assert!(Path::new(&safety_copy).is_file());
    }

    #[tokio::test]
    async fn test_unknown_scope_and_missing_archive() {
        let fakes = backed_up().await;
        let coordinator = RestoreCoordinator::new(fakes.ctx.clone());

        let err = coordinator.restore(&plan(&["traces"], false), &AssumeYes).await.unwrap_err();
        assert!(matches!(err, RestoreError::UnknownScope(_)));

        let missing = RestorePlan {
            archive: ArchiveRef::Path(fakes.dir.path().join("nope.tar.zst")),
            ..plan(&["datastore"], false)
        };
        let err = coordinator.restore(&missing, &AssumeYes).await.unwrap_err();
        assert!(matches!(err, RestoreError::ArchiveNotFound(_)));
    }
}

//! Pre- and post-archive hooks per source.
//!
//! Each pre-hook side effect registers its undo action on the session the
//! moment it happens (snapshot created -> discard it, service stopped ->
//! start it, staging dir created -> remove it). `HookSession::close` runs
//! the registered actions in reverse order; if a session is dropped without
//! being closed (early return, panic, cancelled task) the same actions are
//! spawned from `Drop`. Registration and cleanup are therefore one
//! construct and no exit path can skip a post-hook.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::adapters::config_api::export_items;
use crate::adapters::{ConfigApi, ServiceRuntime};
use crate::archive::ResolvedSource;
use crate::layout::ArtifactLayout;
use crate::lock::{LiveStateGuard, LiveStateLock};
use crate::models::{SourceKind, SourceSpec};
use crate::snapshot::{SnapshotHandle, SnapshotProvider};
use crate::utils::errors::SnapshotError;
use crate::utils::logger::RunLog;

/// Cleanup registered by a pre-hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostAction {
    DiscardSnapshot(SnapshotHandle),
    RestartService(String),
    RemoveStaging(PathBuf),
}

impl PostAction {
    fn describe(&self) -> String {
        match self {
            PostAction::DiscardSnapshot(h) => format!("discard snapshot {}", h.name),
            PostAction::RestartService(c) => format!("restart {}", c),
            PostAction::RemoveStaging(p) => format!("remove staging {}", p.display()),
        }
    }
}

/// Result of one source's pre-hook.
#[derive(Debug, Clone)]
pub enum PreOutcome {
    /// Captured and ready for the archive builder.
    Ready { source: ResolvedSource, warnings: Vec<String> },
    /// Deliberately left out for this run (e.g. snapshot API disabled).
    Skipped { reason: String },
    Failed { reason: String },
}

/// A post-action that did not complete.
#[derive(Debug, Clone)]
pub struct PostFailure {
    pub source: String,
    pub action: String,
    pub reason: String,
}

/// Shared collaborators for hook sessions.
#[derive(Clone)]
pub struct HookRunner {
    runtime: Arc<dyn ServiceRuntime>,
    snapshots: Option<Arc<dyn SnapshotProvider>>,
    config_api: Option<Arc<dyn ConfigApi>>,
    layout: ArtifactLayout,
    lock: LiveStateLock,
}

impl HookRunner {
    pub fn new(
        runtime: Arc<dyn ServiceRuntime>,
        snapshots: Option<Arc<dyn SnapshotProvider>>,
        config_api: Option<Arc<dyn ConfigApi>>,
        layout: ArtifactLayout,
        lock: LiveStateLock,
    ) -> Self {
        Self {
            runtime,
            snapshots,
            config_api,
            layout,
            lock,
        }
    }

    pub fn session(&self, tier: &str, run_id: &str, log: Arc<RunLog>) -> HookSession {
        HookSession {
            runner: self.clone(),
            tier: tier.to_string(),
            run_id: run_id.to_string(),
            log,
            actions: Vec::new(),
            lock_guard: None,
            closed: false,
        }
    }
}

pub struct HookSession {
    runner: HookRunner,
    tier: String,
    run_id: String,
    log: Arc<RunLog>,
    actions: Vec<(String, PostAction)>,
    lock_guard: Option<LiveStateGuard>,
    closed: bool,
}

impl HookSession {
    fn register(&mut self, source: &str, action: PostAction) {
        self.actions.push((source.to_string(), action));
    }

    /// Pending post-actions, in registration order.
    pub fn pending(&self) -> Vec<PostAction> {
        self.actions.iter().map(|(_, a)| a.clone()).collect()
    }

    /// Run the pre-hook of one source.
    pub async fn run_pre(&mut self, source: &SourceSpec) -> PreOutcome {
        if let Some(pre) = &source.pre_exec {
            if let Err(e) = self.runner.runtime.exec(&pre.service, &pre.command).await {
                return PreOutcome::Failed {
                    reason: format!("pre-exec in {} failed: {}", pre.service, e),
                };
            }
            self.log.info(format!("source={} pre-exec in {} ok", source.name, pre.service));
        }

        let resolved = |root: PathBuf| ResolvedSource {
            name: source.name.clone(),
            kind: source.kind.label().to_string(),
            root,
            mandatory: source.mandatory,
            exclude: source.exclude.clone(),
        };

        match &source.kind {
            SourceKind::Path { path } => {
                if tokio::fs::metadata(path).await.is_err() {
                    return PreOutcome::Failed {
                        reason: format!("{} does not exist", path.display()),
                    };
                }
                PreOutcome::Ready {
                    source: resolved(path.clone()),
                    warnings: Vec::new(),
                }
            }

            SourceKind::Volume {
                volume,
                subpath,
                quiesce,
            } => {
                if let Some(container) = quiesce {
                    if let Err(reason) = self.quiesce(&source.name, container).await {
                        return PreOutcome::Failed { reason };
                    }
                }

                let staging = self.runner.layout.staging_dir(&self.run_id).join(&source.name);
                self.register(&source.name, PostAction::RemoveStaging(staging.clone()));
                match self
                    .runner
                    .runtime
                    .copy_from_volume(volume, subpath.as_deref(), &staging)
                    .await
                {
                    Ok(()) => PreOutcome::Ready {
                        source: resolved(staging),
                        warnings: Vec::new(),
                    },
                    Err(e) => PreOutcome::Failed {
                        reason: format!("copy out of volume {} failed: {}", volume, e),
                    },
                }
            }

            SourceKind::Snapshot => {
                let Some(snapshots) = self.runner.snapshots.clone() else {
                    return PreOutcome::Failed {
                        reason: "no snapshot provider configured".to_string(),
                    };
                };

                let handle = match snapshots.create_snapshot().await {
                    Ok(handle) => handle,
                    Err(SnapshotError::AdminApiDisabled) => {
                        return PreOutcome::Skipped {
                            reason: "snapshot admin API is disabled".to_string(),
                        }
                    }
                    Err(e) => return PreOutcome::Failed { reason: e.to_string() },
                };
                self.register(&source.name, PostAction::DiscardSnapshot(handle.clone()));

                let staging = self.runner.layout.staging_dir(&self.run_id).join(&source.name);
                self.register(&source.name, PostAction::RemoveStaging(staging.clone()));
                match snapshots.materialize(&handle, &staging).await {
                    Ok(()) => PreOutcome::Ready {
                        source: resolved(staging),
                        warnings: Vec::new(),
                    },
                    Err(e) => PreOutcome::Failed { reason: e.to_string() },
                }
            }

            SourceKind::Export { kinds } => {
                let Some(api) = self.runner.config_api.clone() else {
                    return PreOutcome::Failed {
                        reason: "no config API configured".to_string(),
                    };
                };

                let dest = self.runner.layout.exports_dir(&self.tier, &self.run_id);
                match export_items(api.as_ref(), kinds, &dest).await {
                    Ok(summary) if summary.written == 0 && summary.failed > 0 => PreOutcome::Failed {
                        reason: format!("export failed: {}", summary.errors.join("; ")),
                    },
                    Ok(summary) => {
                        self.log.info(format!(
                            "source={} exported {} items ({} failed)",
                            source.name, summary.written, summary.failed
                        ));
                        PreOutcome::Ready {
                            source: resolved(dest),
                            warnings: summary.errors,
                        }
                    }
                    Err(e) => PreOutcome::Failed { reason: e.to_string() },
                }
            }
        }
    }

    /// Stop a running service for a consistent copy, under the live-state lock.
    async fn quiesce(&mut self, source: &str, container: &str) -> Result<(), String> {
        if self.lock_guard.is_none() {
            let holder = format!("backup:{}:{}", self.tier, self.run_id);
            let guard = self.runner.lock.acquire(&holder).await.map_err(|e| e.to_string())?;
            self.lock_guard = Some(guard);
        }

        let running = self
            .runner
            .runtime
            .is_running(container)
            .await
            .map_err(|e| e.to_string())?;
        if !running {
            // Nothing to quiesce, and nothing to restart afterwards.
            self.log.warn(format!("source={} service {} was not running", source, container));
            return Ok(());
        }

        self.runner
            .runtime
            .stop(container)
            .await
            .map_err(|e| format!("failed to stop {}: {}", container, e))?;
        self.register(source, PostAction::RestartService(container.to_string()));
        self.log.info(format!("source={} stopped {}", source, container));
        Ok(())
    }

    /// Run every registered post-action, newest first, then release the
    /// live-state lock. Failures are collected, never short-circuit.
    pub async fn close(mut self) -> Vec<PostFailure> {
        self.closed = true;
        let actions = std::mem::take(&mut self.actions);
        let guard = self.lock_guard.take();
        let failures = run_actions(&self.runner, actions, Some(self.log.as_ref())).await;
        drop(guard);
        failures
    }
}

impl Drop for HookSession {
    fn drop(&mut self) {
        if self.closed || self.actions.is_empty() {
            return;
        }

        let actions = std::mem::take(&mut self.actions);
        let guard = self.lock_guard.take();
        let runner = self.runner.clone();
        let tier = self.tier.clone();
        warn!(%tier, pending = actions.len(), "Hook session dropped without close, running post-actions");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let failures = run_actions(&runner, actions, None).await;
                    drop(guard);
                    for failure in failures {
                        warn!(%tier, source = %failure.source, action = %failure.action, reason = %failure.reason, "Post-action failed");
                    }
                });
            }
            Err(_) => {
                warn!(%tier, "No runtime available for post-actions; services may remain stopped");
            }
        }
    }
}

async fn run_actions(
    runner: &HookRunner,
    actions: Vec<(String, PostAction)>,
    log: Option<&RunLog>,
) -> Vec<PostFailure> {
    let mut failures = Vec::new();

    for (source, action) in actions.into_iter().rev() {
        let result = match &action {
            PostAction::DiscardSnapshot(handle) => match &runner.snapshots {
                Some(snapshots) => snapshots.discard(handle).await.map_err(|e| e.to_string()),
                None => Ok(()),
            },
            PostAction::RestartService(container) => runner
                .runtime
                .start(container)
                .await
                .map_err(|e| e.to_string()),
            PostAction::RemoveStaging(path) => match tokio::fs::remove_dir_all(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.to_string()),
            },
        };

        match result {
            Ok(()) => {
                info!(%source, action = %action.describe(), "Post-action done");
                if let Some(log) = log {
                    log.info(format!("source={} post {}", source, action.describe()));
                }
            }
            Err(reason) => {
                if let Some(log) = log {
                    log.warn(format!("source={} post {} failed: {}", source, action.describe(), reason));
                }
                failures.push(PostFailure {
                    source,
                    action: action.describe(),
                    reason,
                });
            }
        }
    }

    failures
}

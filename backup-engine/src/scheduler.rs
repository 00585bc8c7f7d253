//! Per-tier run state: exclusive runs, trigger coalescing and recovery of
//! runs interrupted by a dead process.
//!
//! ```text
//! Idle -> Running -> {Succeeded, Failed} -> Idle
//! ```
//!
//! The cadence itself (cron) is driven by the daemon; this module only
//! decides whether a trigger starts a run.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::layout::ArtifactLayout;
use crate::utils::errors::{EngineError, Result};
use crate::utils::logger::RunLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierRunState {
    pub status: RunStatus,
    pub run_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<RunStatus>,
    pub last_finished_at: Option<DateTime<Utc>>,
    /// Triggers dropped because a run was already in progress.
    pub coalesced: u64,
}

impl Default for TierRunState {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            run_id: None,
            started_at: None,
            last_outcome: None,
            last_finished_at: None,
            coalesced: 0,
        }
    }
}

pub enum TriggerOutcome {
    Started(RunPermit),
    /// A run was already in progress; this trigger was dropped.
    Coalesced { running_run: String },
}

#[derive(Clone, Default)]
pub struct TierScheduler {
    states: Arc<DashMap<String, TierRunState>>,
}

impl TierScheduler {
    pub fn new<I, S>(tiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let states = DashMap::new();
        for tier in tiers {
            states.insert(tier.into(), TierRunState::default());
        }
        Self {
            states: Arc::new(states),
        }
    }

    /// Start a run unless one is in progress. The check and the transition
    /// happen under the same shard lock, so concurrent triggers race safely.
    pub fn try_start(&self, tier: &str) -> Result<TriggerOutcome> {
        let mut state = self
            .states
            .get_mut(tier)
            .ok_or_else(|| EngineError::UnknownTier(tier.to_string()))?;

        if state.status == RunStatus::Running {
            state.coalesced += 1;
            let running_run = state.run_id.clone().unwrap_or_default();
            info!(tier, run_id = %running_run, "Trigger coalesced into running run");
            return Ok(TriggerOutcome::Coalesced { running_run });
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        state.status = RunStatus::Running;
        state.run_id = Some(run_id.clone());
        state.started_at = Some(Utc::now());

        Ok(TriggerOutcome::Started(RunPermit {
            tier: tier.to_string(),
            run_id,
            states: self.states.clone(),
            finished: false,
        }))
    }

    pub fn state(&self, tier: &str) -> Option<TierRunState> {
        self.states.get(tier).map(|s| s.clone())
    }

    /// Every tier's state, sorted by tier name.
    pub fn snapshot(&self) -> Vec<(String, TierRunState)> {
        let mut all: Vec<_> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Record an outcome discovered outside a permit (a recovered marker).
    pub fn record_outcome(&self, tier: &str, outcome: RunStatus) {
        if let Some(mut state) = self.states.get_mut(tier) {
            state.last_outcome = Some(outcome);
            state.last_finished_at = Some(Utc::now());
        }
    }
}

/// Proof that the holder owns the tier's single run slot. Dropping it
/// without `finish` (early return, panic, aborted task) records `Failed`.
pub struct RunPermit {
    tier: String,
    run_id: String,
    states: Arc<DashMap<String, TierRunState>>,
    finished: bool,
}

impl RunPermit {
    pub fn tier(&self) -> &str {
        &self.tier
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn finish(mut self, outcome: RunStatus) {
        self.release(outcome);
        self.finished = true;
    }

    /// Give the slot back without an outcome: the tier turned out to be
    /// running in another process, so this trigger counts as coalesced.
    pub fn coalesce(mut self) {
        if let Some(mut state) = self.states.get_mut(&self.tier) {
            state.status = RunStatus::Idle;
            state.run_id = None;
            state.started_at = None;
            state.coalesced += 1;
        }
        self.finished = true;
    }

    fn release(&self, outcome: RunStatus) {
        if let Some(mut state) = self.states.get_mut(&self.tier) {
            state.status = RunStatus::Idle;
            state.run_id = None;
            state.started_at = None;
            state.last_outcome = Some(outcome);
            state.last_finished_at = Some(Utc::now());
        }
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        if !self.finished {
            warn!(tier = %self.tier, run_id = %self.run_id, "Run ended without an outcome, marking failed");
            self.release(RunStatus::Failed);
        }
    }
}

// ── Run markers ──

/// Written into the tier directory for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMarker {
    pub run_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Result of trying to take a tier's run marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerClaim {
    /// The marker is ours. `recovered` is a dead run that held it before.
    Claimed {
        marker: RunMarker,
        recovered: Option<RunMarker>,
    },
    /// Another live process holds the marker.
    ActiveElsewhere(RunMarker),
}

const CLAIM_ATTEMPTS: usize = 3;

impl RunMarker {
    /// Take the tier's marker for `run_id`. The marker is staged under a
    /// per-process name and hard-linked into place, which fails when a marker
    /// already exists; readers never see a half-written marker. An existing
    /// marker of a dead process is recovered and the claim retried.
    pub fn claim(layout: &ArtifactLayout, tier: &str, run_id: &str) -> Result<MarkerClaim> {
        let marker = Self {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        let path = layout.run_marker(tier);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staged = path.with_file_name(format!(".run-marker.{}.staged", marker.pid));
        std::fs::write(&staged, serde_json::to_vec_pretty(&marker)?)?;

        let result = Self::link_staged(layout, tier, &staged, marker);
        if let Err(e) = std::fs::remove_file(&staged) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(tier, error = %e, "Failed to remove staged run marker");
            }
        }
        result
    }

    fn link_staged(layout: &ArtifactLayout, tier: &str, staged: &Path, marker: RunMarker) -> Result<MarkerClaim> {
        let path = layout.run_marker(tier);
        let mut recovered = None;
        for _ in 0..CLAIM_ATTEMPTS {
            match std::fs::hard_link(staged, &path) {
                Ok(()) => return Ok(MarkerClaim::Claimed { marker, recovered }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match recover_interrupted(layout, tier)? {
                        MarkerState::ActiveElsewhere(other) => return Ok(MarkerClaim::ActiveElsewhere(other)),
                        MarkerState::Recovered(dead) => recovered = Some(dead),
                        MarkerState::Clear => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("run marker for tier {} kept reappearing", tier),
        )))
    }

    pub fn read(layout: &ArtifactLayout, tier: &str) -> Option<Self> {
        let content = std::fs::read_to_string(layout.run_marker(tier)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn clear(layout: &ArtifactLayout, tier: &str) {
        if let Err(e) = std::fs::remove_file(layout.run_marker(tier)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(tier, error = %e, "Failed to remove run marker");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerState {
    Clear,
    /// A dead run was found and cleaned up; it counts as `Failed`.
    Recovered(RunMarker),
    /// Another live process is running this tier.
    ActiveElsewhere(RunMarker),
}

/// Inspect a tier's run marker before starting a run. A marker whose
/// process is gone is converted into a failed outcome: its temporary
/// archive and staging area are deleted (never promoted) and its run log
/// gets a closing line.
pub fn recover_interrupted(layout: &ArtifactLayout, tier: &str) -> Result<MarkerState> {
    let path = layout.run_marker(tier);
    if !path.exists() {
        return Ok(MarkerState::Clear);
    }

    let Some(marker) = RunMarker::read(layout, tier) else {
        warn!(tier, "Unreadable run marker, discarding");
        std::fs::remove_file(&path)?;
        return Ok(MarkerState::Clear);
    };

    if marker.pid != std::process::id() && process_alive(marker.pid) {
        return Ok(MarkerState::ActiveElsewhere(marker));
    }

    warn!(tier, run_id = %marker.run_id, pid = marker.pid, "Recovering interrupted run as failed");

    let prefix = format!(".{}-", tier);
    if let Ok(entries) = std::fs::read_dir(layout.tier_dir(tier)) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(".tmp") {
                std::fs::remove_file(entry.path())?;
            }
        }
    }

    let staging = layout.staging_dir(&marker.run_id);
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }

    RunLog::open(&layout.run_log(tier, &marker.run_id)).error(format!(
        "run interrupted (pid {} gone), recorded as failed",
        marker.pid
    ));

    std::fs::remove_file(&path)?;
    Ok(MarkerState::Recovered(marker))
}

fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_trigger_is_coalesced() {
        let scheduler = TierScheduler::new(["critical", "bulk"]);

        let permit = match scheduler.try_start("critical").unwrap() {
            TriggerOutcome::Started(p) => p,
            TriggerOutcome::Coalesced { .. } => panic!("first trigger must start"),
        };

        match scheduler.try_start("critical").unwrap() {
            TriggerOutcome::Coalesced { running_run } => assert_eq!(running_run, permit.run_id()),
            TriggerOutcome::Started(_) => panic!("second trigger must coalesce"),
        }

        // Other tiers are independent
        assert!(matches!(scheduler.try_start("bulk").unwrap(), TriggerOutcome::Started(_)));

        permit.finish(RunStatus::Succeeded);
        let state = scheduler.state("critical").unwrap();
        assert_eq!(state.status, RunStatus::Idle);
        assert_eq!(state.last_outcome, Some(RunStatus::Succeeded));
        assert_eq!(state.coalesced, 1);
    }

    #[test]
    fn test_dropped_permit_marks_failed() {
        let scheduler = TierScheduler::new(["critical"]);
        if let TriggerOutcome::Started(permit) = scheduler.try_start("critical").unwrap() {
            drop(permit);
        }
        let state = scheduler.state("critical").unwrap();
        assert_eq!(state.status, RunStatus::Idle);
        assert_eq!(state.last_outcome, Some(RunStatus::Failed));
    }

    #[test]
    fn test_unknown_tier() {
        let scheduler = TierScheduler::new(["critical"]);
        assert!(matches!(scheduler.try_start("weekly"), Err(EngineError::UnknownTier(_))));
    }

    #[tokio::test]
    async fn test_concurrent_triggers_start_exactly_once() {
        let scheduler = TierScheduler::new(["critical"]);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                match scheduler.try_start("critical").unwrap() {
                    TriggerOutcome::Started(permit) => {
                        // Keep the slot until every trigger has fired.
                        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                        permit.finish(RunStatus::Succeeded);
                        1
                    }
                    TriggerOutcome::Coalesced { .. } => 0,
                }
            }));
        }

        let mut started = 0;
        for handle in handles {
            started += handle.await.unwrap();
        }
        assert_eq!(started, 1);
        assert_eq!(scheduler.state("critical").unwrap().coalesced, 15);
    }

    #[test]
    fn test_recover_dead_marker() {
        let dir = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        std::fs::create_dir_all(layout.tier_dir("bulk")).unwrap();

        let marker = RunMarker {
            run_id: "dead-run".to_string(),
            pid: u32::MAX - 1,
            started_at: Utc::now(),
        };
        std::fs::write(layout.run_marker("bulk"), serde_json::to_vec(&marker).unwrap()).unwrap();
        let orphan = layout.tier_dir("bulk").join(".bulk-20261019T020000Z-deadrun.tar.zst.tmp");
        std::fs::write(&orphan, b"partial").unwrap();
        std::fs::create_dir_all(layout.staging_dir("dead-run")).unwrap();

        let state = recover_interrupted(&layout, "bulk").unwrap();
        assert_eq!(state, MarkerState::Recovered(marker));
        assert!(!orphan.exists());
        assert!(!layout.staging_dir("dead-run").exists());
        assert!(!layout.run_marker("bulk").exists());

        let log = std::fs::read_to_string(layout.run_log("bulk", "dead-run")).unwrap();
        assert!(log.contains("ERROR run interrupted"));

        assert_eq!(recover_interrupted(&layout, "bulk").unwrap(), MarkerState::Clear);
    }

    #[test]
    fn test_claim_recovers_dead_marker_then_excludes_others() {
        let dir = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        std::fs::create_dir_all(layout.tier_dir("bulk")).unwrap();

        let dead = RunMarker {
            run_id: "dead-run".to_string(),
            pid: u32::MAX - 1,
            started_at: Utc::now(),
        };
        std::fs::write(layout.run_marker("bulk"), serde_json::to_vec(&dead).unwrap()).unwrap();

        let MarkerClaim::Claimed { marker, recovered } = RunMarker::claim(&layout, "bulk", "run-a").unwrap() else {
            panic!("expected claim");
        };
        assert_eq!(recovered, Some(dead));
        assert_eq!(RunMarker::read(&layout, "bulk"), Some(marker));

        // Only the marker itself is left in the tier directory.
        let names: Vec<_> = std::fs::read_dir(layout.tier_dir("bulk"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![".run-marker.json".to_string()]);

        let live = RunMarker {
            run_id: "other".to_string(),
            pid: 1,
            started_at: Utc::now(),
        };
        std::fs::write(layout.run_marker("bulk"), serde_json::to_vec(&live).unwrap()).unwrap();
        assert_eq!(
            RunMarker::claim(&layout, "bulk", "run-b").unwrap(),
            MarkerClaim::ActiveElsewhere(live.clone())
        );
        assert_eq!(RunMarker::read(&layout, "bulk"), Some(live));
    }

    #[test]
    fn test_coalesced_permit_keeps_last_outcome() {
        let scheduler = TierScheduler::new(["critical"]);
        let TriggerOutcome::Started(permit) = scheduler.try_start("critical").unwrap() else {
            panic!("expected start");
        };
        permit.finish(RunStatus::Succeeded);

        let TriggerOutcome::Started(permit) = scheduler.try_start("critical").unwrap() else {
            panic!("expected start");
        };
        permit.coalesce();

        let state = scheduler.state("critical").unwrap();
        assert_eq!(state.status, RunStatus::Idle);
        assert_eq!(state.last_outcome, Some(RunStatus::Succeeded));
        assert_eq!(state.coalesced, 1);
        assert!(matches!(scheduler.try_start("critical").unwrap(), TriggerOutcome::Started(_)));
    }

    #[test]
    fn test_live_marker_from_other_process() {
        let dir = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        std::fs::create_dir_all(layout.tier_dir("bulk")).unwrap();

        // pid 1 always exists
        let marker = RunMarker {
            run_id: "other".to_string(),
            pid: 1,
            started_at: Utc::now(),
        };
        std::fs::write(layout.run_marker("bulk"), serde_json::to_vec(&marker).unwrap()).unwrap();

        assert_eq!(
            recover_interrupted(&layout, "bulk").unwrap(),
            MarkerState::ActiveElsewhere(marker)
        );
        assert!(layout.run_marker("bulk").exists());
    }
}

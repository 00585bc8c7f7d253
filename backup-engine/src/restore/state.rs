//! Restore checkpoints.
//!
//! The coordinator records every completed step in `restore-state.json`
//! beside the safety copy. After a crash the file says how far the restore
//! got and where the pre-restore state was put.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::fs::write_atomic;

pub const STATE_FILE: &str = "restore-state.json";

/// Steps of a restore, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStep {
    Verified,
    Confirmed,
    Extracted,
    ServicesStopped,
    SafetyCopied,
    Replaced,
    ServicesRestarted,
    ConfigImported,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreState {
    pub run_id: String,
    pub archive: PathBuf,
    pub scopes: Vec<String>,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed: Vec<RestoreStep>,
    #[serde(default)]
    pub safety_copy: Option<PathBuf>,
    #[serde(default)]
    pub failure: Option<String>,
}

/// In-memory state, mirrored to disk once a location exists. Dry runs never
/// get a location.
pub struct Checkpoint {
    path: Option<PathBuf>,
    state: RestoreState,
}

impl Checkpoint {
    pub fn new(run_id: &str, archive: &Path, scopes: &[String], dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            path: None,
            state: RestoreState {
                run_id: run_id.to_string(),
                archive: archive.to_path_buf(),
                scopes: scopes.to_vec(),
                dry_run,
                started_at: now,
                updated_at: now,
                completed: Vec::new(),
                safety_copy: None,
                failure: None,
            },
        }
    }

    /// Start persisting into `dir` (the safety run directory).
    pub fn attach(&mut self, dir: &Path) {
        self.path = Some(dir.join(STATE_FILE));
        self.persist();
    }

    pub fn set_safety_copy(&mut self, path: &Path) {
        self.state.safety_copy = Some(path.to_path_buf());
        self.persist();
    }

    pub fn complete(&mut self, step: RestoreStep) {
        if !self.state.completed.contains(&step) {
            self.state.completed.push(step);
        }
        self.persist();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state.failure = Some(reason.into());
        self.persist();
    }

    pub fn state(&self) -> &RestoreState {
        &self.state
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&mut self) {
        self.state.updated_at = Utc::now();
        let Some(path) = &self.path else {
            return;
        };
        let written = serde_json::to_vec_pretty(&self.state)
            .map_err(std::io::Error::other)
            .and_then(|content| write_atomic(path, &content));
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "Failed to write restore checkpoint");
        }
    }

    /// Read a checkpoint left by an earlier restore.
    pub fn load(path: &Path) -> Option<RestoreState> {
        let content = std::fs::read(path).ok()?;
        serde_json::from_slice(&content).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_checkpoint_persists_after_attach() {
        let dir = TempDir::new().unwrap();
        let mut checkpoint = Checkpoint::new("run-1", Path::new("/a.tar.zst"), &["datastore".to_string()], false);
        checkpoint.complete(RestoreStep::Verified);
        assert!(checkpoint.path().is_none());

        checkpoint.attach(dir.path());
        checkpoint.complete(RestoreStep::ServicesStopped);
        checkpoint.complete(RestoreStep::ServicesStopped);
        checkpoint.fail("replace failed");

        let loaded = Checkpoint::load(&dir.path().join(STATE_FILE)).unwrap();
        assert_eq!(loaded.completed, vec![RestoreStep::Verified, RestoreStep::ServicesStopped]);
        assert_eq!(loaded.failure.as_deref(), Some("replace failed"));
        assert_eq!(loaded.scopes, vec!["datastore".to_string()]);
    }

    #[test]
    fn test_dry_run_checkpoint_stays_in_memory() {
        let mut checkpoint = Checkpoint::new("run-2", Path::new("/a.tar.zst"), &[], true);
        checkpoint.complete(RestoreStep::Completed);
        assert_eq!(checkpoint.state().completed, vec![RestoreStep::Completed]);
        assert!(checkpoint.path().is_none());
    }
}

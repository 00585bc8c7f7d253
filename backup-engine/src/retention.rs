//! Age-based pruning of archives, exports and run logs.
//!
//! The archive the tier's latest pointer references is never removed, even
//! when it is past the retention age. Without a valid pointer the newest
//! archive takes its place, so a tier is never left with zero archives.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::layout::ArtifactLayout;
use crate::models::{Archive, BackupTier};
use crate::utils::errors::Result;

/// Which archives a prune would remove.
#[derive(Debug, Clone, PartialEq)]
pub struct PrunePlan {
    pub remove: Vec<Archive>,
    pub keep: Vec<Archive>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub tier: String,
    pub removed: Vec<String>,
    pub kept: Vec<String>,
    pub exports_removed: usize,
    pub logs_removed: usize,
}

/// Split `archives` into keep/remove. Pure: same input, same plan.
pub fn plan_prune(
    archives: Vec<Archive>,
    latest: Option<&Path>,
    retention: Duration,
    now: DateTime<Utc>,
) -> PrunePlan {
    let protected: Option<PathBuf> = latest.map(Path::to_path_buf).or_else(|| {
        archives
            .iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.file_name.cmp(&b.file_name)))
            .map(|a| a.path.clone())
    });

    let max_age = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let (remove, keep): (Vec<Archive>, Vec<Archive>) = archives.into_iter().partition(|archive| {
        let is_protected = protected.as_deref() == Some(archive.path.as_path());
        !is_protected && archive.age(now) > max_age
    });

    PrunePlan { remove, keep }
}

/// Apply the tier's retention to its archives, exports and run logs.
pub async fn prune(layout: &ArtifactLayout, tier: &BackupTier) -> Result<PruneReport> {
    let layout = layout.clone();
    let tier_name = tier.name.clone();
    let retention = tier.retention;
    tokio::task::spawn_blocking(move || prune_blocking(&layout, &tier_name, retention, Utc::now())).await?
}

fn prune_blocking(
    layout: &ArtifactLayout,
    tier: &str,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<PruneReport> {
    let archives = layout.list_archives(tier)?;
    let latest = layout.read_latest(tier);
    let plan = plan_prune(archives, latest.as_deref(), retention, now);

    let mut report = PruneReport {
        tier: tier.to_string(),
        kept: plan.keep.iter().map(|a| a.file_name.clone()).collect(),
        ..Default::default()
    };

    for archive in plan.remove {
        std::fs::remove_file(&archive.path)?;
        let sidecar = ArtifactLayout::sidecar_path(&archive.path);
        if let Err(e) = std::fs::remove_file(&sidecar) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(sidecar = %sidecar.display(), error = %e, "Failed to remove sidecar");
            }
        }
        info!(tier, archive = %archive.file_name, "Pruned archive");
        report.removed.push(archive.file_name);
    }

    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    report.exports_removed = prune_artifacts(&layout.tier_exports_dir(tier), cutoff)?;
    report.logs_removed = prune_artifacts(&layout.tier_logs_dir(tier), cutoff)?;

    Ok(report)
}

/// Remove direct children of `dir` (files or whole run directories) last
/// modified before `cutoff`. Returns how many were removed.
pub fn prune_artifacts(dir: &Path, cutoff: SystemTime) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.modified()? >= cutoff {
            continue;
        }
        if metadata.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
        removed += 1;
    }
    Ok(removed)
}

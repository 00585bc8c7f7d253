//! Archive builder - packs resolved sources into one compressed, verified
//! archive and publishes it.
//!
//! The archive is written under a hidden temporary name, fully verified,
//! and only then renamed into place; its sidecar follows the rename. A reader
//! that sees the final name therefore always sees a complete archive, and a
//! sidecar never exists without its archive.

pub mod digest;
pub mod verify;

use chrono::{DateTime, Utc};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::fs::walker::{walk_directory, WalkOptions};
use crate::layout::ArtifactLayout;
use crate::models::{Archive, BackupMetadata, CompressionMode, SourceInclusion, EMBEDDED_METADATA};
use crate::utils::errors::{ArchiveError, EngineError};

pub use verify::{extract_entries, read_embedded_metadata, verify_archive, VerifyReport};

/// A source after capture: a directory (or single file) on the host whose
/// contents go under `name/` in the archive.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub name: String,
    pub kind: String,
    pub root: PathBuf,
    pub mandatory: bool,
    pub exclude: Vec<String>,
}

/// Where a finished archive is published.
#[derive(Debug, Clone)]
pub enum Destination {
    /// `archives/<label>/`, with the latest pointer moved to it.
    Tier,
    /// An arbitrary directory; no pointer is touched (safety copies).
    Detached { dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Tier name, or a label such as `safety` for detached archives.
    pub label: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub compression: CompressionMode,
    pub sources: Vec<ResolvedSource>,
    /// Sources left out before capture, recorded with their reason.
    pub skipped: Vec<SourceInclusion>,
    pub revision: Option<String>,
    pub destination: Destination,
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub archive: Archive,
    /// Non-fatal problems (optional sources dropped, files vanished mid-read).
    pub warnings: Vec<String>,
}

/// Builds archives for one artifact root.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    layout: ArtifactLayout,
}

impl ArchiveBuilder {
    pub fn new(layout: ArtifactLayout) -> Self {
        Self { layout }
    }

    /// Build, verify and publish an archive. Compression runs on the
    /// blocking pool; the temporary file never survives a failure.
    pub async fn build(&self, request: BuildRequest) -> Result<BuildOutput, ArchiveError> {
        let layout = self.layout.clone();
        tokio::task::spawn_blocking(move || build_blocking(&layout, request))
            .await
            .map_err(|e| ArchiveError::Engine(EngineError::from(e)))?
    }
}

/// Removes the temporary archive unless it was published.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove temporary archive");
                }
            }
        }
    }
}

fn build_blocking(layout: &ArtifactLayout, request: BuildRequest) -> Result<BuildOutput, ArchiveError> {
    let dir = match &request.destination {
        Destination::Tier => layout.tier_dir(&request.label),
        Destination::Detached { dir } => dir.clone(),
    };
    std::fs::create_dir_all(&dir)?;

    let file_name = ArtifactLayout::archive_file_name(&request.label, request.created_at, &request.run_id);
    let final_path = dir.join(&file_name);
    let temp_path = ArtifactLayout::temp_path(&final_path);
    let mut guard = TempFileGuard::new(temp_path.clone());

    let (metadata, warnings) = write_archive(&temp_path, &request)?;

    let expected = metadata.expected_entries();
    let report = verify_archive(&temp_path, None, Some(&expected)).map_err(|e| match e {
        ArchiveError::IntegrityCheckFailed { reason, .. } => ArchiveError::IntegrityCheckFailed {
            path: final_path.clone(),
            reason,
        },
        other => other,
    })?;

    let archive = Archive {
        path: final_path.clone(),
        file_name: file_name.clone(),
        tier: request.label.clone(),
        created_at: request.created_at,
        compression: request.compression,
        size_bytes: std::fs::metadata(&temp_path)?.len(),
        digest: report.digest,
        metadata,
    };

    std::fs::rename(&temp_path, &final_path)?;
    guard.disarm();
    if let Err(e) = write_sidecar(&final_path, &archive) {
        // The embedded metadata still describes the archive.
        warn!(archive = %final_path.display(), error = %e, "Failed to write archive sidecar");
    }

    if matches!(request.destination, Destination::Tier) {
        layout.set_latest(&request.label, &file_name)?;
    }

    info!(
        archive = %final_path.display(),
        size = archive.size_bytes,
        digest = %archive.short_digest(),
        "Archive published"
    );

    Ok(BuildOutput { archive, warnings })
}

fn write_archive(
    temp_path: &Path,
    request: &BuildRequest,
) -> Result<(BackupMetadata, Vec<String>), ArchiveError> {
    let file = File::create(temp_path)?;
    let mut encoder = zstd::Encoder::new(file, request.compression.zstd_level())
        .map_err(|e| ArchiveError::CompressionFailed(e.to_string()))?;
    // Frame checksum: corruption inside stored blocks fails decompression.
    encoder
        .include_checksum(true)
        .map_err(|e| ArchiveError::CompressionFailed(e.to_string()))?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut warnings = Vec::new();
    let mut inclusions = request.skipped.clone();
    let mut total_bytes = 0u64;

    for source in &request.sources {
        match append_source(&mut builder, source, &mut warnings) {
            Ok(bytes) => {
                total_bytes += bytes;
                inclusions.push(SourceInclusion {
                    name: source.name.clone(),
                    kind: source.kind.clone(),
                    included: true,
                    mandatory: source.mandatory,
                    note: None,
                    bytes,
                });
            }
            Err(e) if source.mandatory => return Err(e),
            Err(e) => {
                warn!(source = %source.name, error = %e, "Optional source left out of archive");
                warnings.push(format!("{}: {}", source.name, e));
                inclusions.push(SourceInclusion {
                    name: source.name.clone(),
                    kind: source.kind.clone(),
                    included: false,
                    mandatory: false,
                    note: Some(e.to_string()),
                    bytes: 0,
                });
            }
        }
    }

    let metadata = BackupMetadata {
        tier: request.label.clone(),
        run_id: request.run_id.clone(),
        created_at: request.created_at,
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
        compression: request.compression,
        sources: inclusions,
        total_bytes,
        revision: request.revision.clone(),
    };

    let document = serde_json::to_vec_pretty(&metadata).map_err(EngineError::from)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(document.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(request.created_at.timestamp().max(0) as u64);
    header.set_cksum();
    builder
        .append_data(&mut header, EMBEDDED_METADATA, document.as_slice())
        .map_err(|e| ArchiveError::CompressionFailed(e.to_string()))?;

    let encoder = builder
        .into_inner()
        .map_err(|e| ArchiveError::CompressionFailed(e.to_string()))?;
    let file = encoder
        .finish()
        .map_err(|e| ArchiveError::CompressionFailed(e.to_string()))?;
    file.sync_all()?;

    Ok((metadata, warnings))
}

/// Append one source under its own top-level directory. Returns the
/// uncompressed bytes of regular files written.
fn append_source<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    source: &ResolvedSource,
    warnings: &mut Vec<String>,
) -> Result<u64, ArchiveError> {
    let unreadable = |reason: String| ArchiveError::SourceUnreadable {
        source_name: source.name.clone(),
        reason,
    };

    let files = walk_directory(&source.root, &WalkOptions::excluding(&source.exclude))
        .map_err(|e| unreadable(format!("{}: {}", source.root.display(), e)))?;

    let top = Path::new(&source.name);
    if source.root.is_dir() {
        builder
            .append_dir(top, &source.root)
            .map_err(|e| unreadable(e.to_string()))?;
    } else {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_mtime(Utc::now().timestamp().max(0) as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, top, std::io::empty())
            .map_err(|e| unreadable(e.to_string()))?;
    }

    let mut bytes = 0u64;
    for file in files {
        let entry_name = top.join(&file.relative_path);
        let result = if file.is_dir && !file.is_symlink {
            builder.append_dir(&entry_name, &file.path)
        } else {
            builder.append_path_with_name(&file.path, &entry_name)
        };

        match result {
            Ok(()) => {
                if !file.is_dir {
                    bytes += file.size;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Live data churns; a file deleted between walk and read is not fatal.
                debug!(path = %file.path.display(), "File vanished during capture");
                warnings.push(format!("{}: {} vanished during capture", source.name, file.relative_path.display()));
            }
            Err(e) => return Err(unreadable(format!("{}: {}", file.path.display(), e))),
        }
    }

    Ok(bytes)
}

fn write_sidecar(archive_path: &Path, archive: &Archive) -> Result<(), ArchiveError> {
    let sidecar = ArtifactLayout::sidecar_path(archive_path);
    let staged = ArtifactLayout::temp_path(&sidecar);
    let content = serde_json::to_vec_pretty(archive).map_err(EngineError::from)?;
    std::fs::write(&staged, content)?;
    std::fs::rename(&staged, &sidecar)?;
    Ok(())
}

//! On-disk artifact layout owned by the engine.
//!
//! ```text
//! <root>/archives/<tier>/<tier>-<timestamp>-<run>.tar.zst   archive
//! <root>/archives/<tier>/<archive>.meta.json                 sidecar
//! <root>/archives/<tier>/latest -> <archive>                 latest pointer
//! <root>/archives/<tier>/.run-marker.json                    in-flight run
//! <root>/exports/<tier>/<run>/<kind>/<id>.json               API exports
//! <root>/logs/<tier>/<run>.log                               per-run log
//! <root>/.staging/<run>/                                     transient captures
//! <root>/.live-state.lock                                    live-state lock
//! ```

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::archive::digest::sha256_file;
use crate::archive::verify::read_embedded_metadata;
use crate::models::{Archive, ARCHIVE_EXTENSION};
use crate::utils::errors::Result;

const LATEST: &str = "latest";
const SIDECAR_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.root.join("archives")
    }

    pub fn tier_dir(&self, tier: &str) -> PathBuf {
        self.archives_dir().join(tier)
    }

    pub fn latest_link(&self, tier: &str) -> PathBuf {
        self.tier_dir(tier).join(LATEST)
    }

    pub fn run_marker(&self, tier: &str) -> PathBuf {
        self.tier_dir(tier).join(".run-marker.json")
    }

    pub fn tier_exports_dir(&self, tier: &str) -> PathBuf {
        self.root.join("exports").join(tier)
    }

    pub fn exports_dir(&self, tier: &str, run_id: &str) -> PathBuf {
        self.tier_exports_dir(tier).join(run_id)
    }

    pub fn tier_logs_dir(&self, tier: &str) -> PathBuf {
        self.root.join("logs").join(tier)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn run_log(&self, tier: &str, run_id: &str) -> PathBuf {
        self.tier_logs_dir(tier).join(format!("{}.log", run_id))
    }

    pub fn staging_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(".staging").join(run_id)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".live-state.lock")
    }

    pub fn health_dir(&self) -> PathBuf {
        self.root.join("health")
    }

    /// Archive file name for a run started at `created_at`.
    pub fn archive_file_name(tier: &str, created_at: DateTime<Utc>, run_id: &str) -> String {
        let short: String = run_id.chars().filter(|c| *c != '-').take(8).collect();
        format!(
            "{}-{}-{}{}",
            tier,
            created_at.format("%Y%m%dT%H%M%SZ"),
            short,
            ARCHIVE_EXTENSION
        )
    }

    /// Hidden temporary name in the same directory, so publishing is a rename.
    pub fn temp_path(final_path: &Path) -> PathBuf {
        let name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        final_path.with_file_name(format!(".{}.tmp", name))
    }

    pub fn sidecar_path(archive_path: &Path) -> PathBuf {
        let name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        archive_path.with_file_name(format!("{}{}", name, SIDECAR_SUFFIX))
    }

    /// Resolve the tier's latest pointer. A dangling pointer reads as `None`.
    pub fn read_latest(&self, tier: &str) -> Option<PathBuf> {
        let link = self.latest_link(tier);
        let target = std::fs::read_link(&link).ok()?;
        let resolved = if target.is_absolute() {
            target
        } else {
            self.tier_dir(tier).join(target)
        };
        resolved.is_file().then_some(resolved)
    }

    /// Atomically repoint `latest` at `file_name` (symlink swap by rename).
    pub(crate) fn set_latest(&self, tier: &str, file_name: &str) -> std::io::Result<()> {
        let tier_dir = self.tier_dir(tier);
        let staged = tier_dir.join(".latest.tmp");
        let _ = std::fs::remove_file(&staged);
        std::os::unix::fs::symlink(file_name, &staged)?;
        std::fs::rename(&staged, self.latest_link(tier))
    }

    /// The archive record stored in its sidecar, if present and readable.
    pub fn load_sidecar(path: &Path) -> Option<Archive> {
        let sidecar = Self::sidecar_path(path);
        let content = std::fs::read_to_string(&sidecar).ok()?;
        match serde_json::from_str::<Archive>(&content) {
            Ok(mut archive) => {
                archive.path = path.to_path_buf();
                Some(archive)
            }
            Err(e) => {
                warn!(sidecar = %sidecar.display(), error = %e, "Unreadable sidecar");
                None
            }
        }
    }

    /// Load one archive from its sidecar, falling back to the file itself.
    pub fn load_archive(path: &Path) -> Result<Archive> {
        if let Some(archive) = Self::load_sidecar(path) {
            return Ok(archive);
        }

        let metadata = read_embedded_metadata(path)?;
        let size_bytes = std::fs::metadata(path)?.len();
        Ok(Archive {
            path: path.to_path_buf(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            tier: metadata.tier.clone(),
            created_at: metadata.created_at,
            compression: metadata.compression,
            size_bytes,
            digest: sha256_file(path)?,
            metadata,
        })
    }

    /// Archive files in a directory, skipping temporaries and pointers.
    pub fn archive_paths(dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.ends_with(ARCHIVE_EXTENSION) {
                continue;
            }
            if entry.file_type()?.is_file() {
                paths.push(entry.path());
            }
        }
        Ok(paths)
    }

    /// All archives of a tier, oldest first. Unreadable archives are logged
    /// and left out.
    pub fn list_archives(&self, tier: &str) -> Result<Vec<Archive>> {
        let mut archives = Vec::new();
        for path in Self::archive_paths(&self.tier_dir(tier))? {
            match Self::load_archive(&path) {
                Ok(archive) => archives.push(archive),
                Err(e) => warn!(archive = %path.display(), error = %e, "Skipping unreadable archive"),
            }
        }
        archives.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.file_name.cmp(&b.file_name)));
        Ok(archives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_archive_file_name() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 2, 0, 5).unwrap();
        let name = ArtifactLayout::archive_file_name("bulk", at, "1a2b3c4d-5e6f-0000-0000-000000000000");
        assert_eq!(name, "bulk-20261019T020005Z-1a2b3c4d.tar.zst");
    }

    #[test]
    fn test_temp_and_sidecar_paths() {
        let p = Path::new("/srv/archives/critical/a.tar.zst");
        assert_eq!(
            ArtifactLayout::temp_path(p),
            PathBuf::from("/srv/archives/critical/.a.tar.zst.tmp")
        );
        assert_eq!(
            ArtifactLayout::sidecar_path(p),
            PathBuf::from("/srv/archives/critical/a.tar.zst.meta.json")
        );
    }

    #[test]
    fn test_latest_pointer_swap() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let layout = ArtifactLayout::new(dir.path());
        std::fs::create_dir_all(layout.tier_dir("critical"))?;
        assert_eq!(layout.read_latest("critical"), None);

        std::fs::write(layout.tier_dir("critical").join("one.tar.zst"), b"1")?;
        std::fs::write(layout.tier_dir("critical").join("two.tar.zst"), b"2")?;

        layout.set_latest("critical", "one.tar.zst")?;
        assert_eq!(
            layout.read_latest("critical"),
            Some(layout.tier_dir("critical").join("one.tar.zst"))
        );

        layout.set_latest("critical", "two.tar.zst")?;
        assert_eq!(
            layout.read_latest("critical"),
            Some(layout.tier_dir("critical").join("two.tar.zst"))
        );

        std::fs::remove_file(layout.tier_dir("critical").join("two.tar.zst"))?;
        assert_eq!(layout.read_latest("critical"), None);
        Ok(())
    }

    #[test]
    fn test_archive_paths_skip_temporaries() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("a.tar.zst"), b"a")?;
        std::fs::write(dir.path().join(".b.tar.zst.tmp"), b"b")?;
        std::fs::write(dir.path().join("a.tar.zst.meta.json"), b"{}")?;

        let paths = ArtifactLayout::archive_paths(dir.path()).unwrap();
        assert_eq!(paths, vec![dir.path().join("a.tar.zst")]);
        Ok(())
    }
}

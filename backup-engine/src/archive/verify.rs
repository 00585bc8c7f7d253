//! Structural and digest verification of archives.
//!
//! Verification decompresses the whole stream (every entry is read to the
//! end) so truncation or bit-rot anywhere in the file is detected, then
//! checks that every included source has its top-level entry.

use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Component, Path};

use super::digest::sha256_file;
use crate::models::{BackupMetadata, EMBEDDED_METADATA};
use crate::utils::errors::{ArchiveError, EngineError, Result};

/// What a successful verification observed.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub digest: String,
    pub entries: usize,
    pub top_level: BTreeSet<String>,
    pub metadata: BackupMetadata,
}

/// Verify an archive file.
///
/// * `expected_digest` - compared against the file's SHA-256 when given
/// * `expected_entries` - defaults to the included sources recorded in the
///   embedded metadata
pub fn verify_archive(
    path: &Path,
    expected_digest: Option<&str>,
    expected_entries: Option<&[String]>,
) -> std::result::Result<VerifyReport, ArchiveError> {
    let fail = |reason: String| ArchiveError::IntegrityCheckFailed {
        path: path.to_path_buf(),
        reason,
    };

    if !path.is_file() {
        return Err(fail("archive file is missing".to_string()));
    }

    let digest = sha256_file(path).map_err(|e| fail(format!("unreadable: {}", e)))?;
    if let Some(expected) = expected_digest {
        if !expected.eq_ignore_ascii_case(&digest) {
            return Err(fail(format!(
                "digest mismatch (expected {}, found {})",
                expected, digest
            )));
        }
    }

    let file = std::fs::File::open(path).map_err(|e| fail(e.to_string()))?;
    let decoder = zstd::Decoder::new(file).map_err(|e| fail(format!("zstd: {}", e)))?;
    let mut archive = tar::Archive::new(decoder);

    let mut entries = 0usize;
    let mut top_level = BTreeSet::new();
    let mut metadata = None;

    let iter = archive
        .entries()
        .map_err(|e| fail(format!("cannot read tar stream: {}", e)))?;
    for entry in iter {
        let mut entry = entry.map_err(|e| fail(format!("corrupt entry: {}", e)))?;
        let entry_path = entry
            .path()
            .map_err(|e| fail(format!("bad entry path: {}", e)))?
            .into_owned();

        let first = top_level_name(&entry_path)
            .ok_or_else(|| fail(format!("unsafe entry path {}", entry_path.display())))?;

        if entry_path == Path::new(EMBEDDED_METADATA) {
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .map_err(|e| fail(format!("metadata unreadable: {}", e)))?;
            metadata = Some(
                serde_json::from_str::<BackupMetadata>(&content)
                    .map_err(|e| fail(format!("metadata invalid: {}", e)))?,
            );
        } else {
            std::io::copy(&mut entry, &mut std::io::sink())
                .map_err(|e| fail(format!("entry {} unreadable: {}", entry_path.display(), e)))?;
        }

        top_level.insert(first);
        entries += 1;
    }

    // Drain past the tar end marker so the zstd frame checksum is checked.
    let mut decoder = archive.into_inner();
    std::io::copy(&mut decoder, &mut std::io::sink())
        .map_err(|e| fail(format!("compressed stream damaged: {}", e)))?;

    let metadata = metadata.ok_or_else(|| fail(format!("{} is missing", EMBEDDED_METADATA)))?;
    let expected = match expected_entries {
        Some(list) => list.to_vec(),
        None => metadata.expected_entries(),
    };
    let missing: Vec<&String> = expected.iter().filter(|e| !top_level.contains(*e)).collect();
    if !missing.is_empty() {
        return Err(fail(format!("missing entries: {:?}", missing)));
    }

    Ok(VerifyReport {
        digest,
        entries,
        top_level,
        metadata,
    })
}

/// Read only the embedded metadata document of an archive.
pub fn read_embedded_metadata(path: &Path) -> Result<BackupMetadata> {
    let file = std::fs::File::open(path)?;
    let decoder = zstd::Decoder::new(file)?;
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_ref() == Path::new(EMBEDDED_METADATA) {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            return Ok(serde_json::from_str(&content)?);
        }
    }

    Err(EngineError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{} has no {}", path.display(), EMBEDDED_METADATA),
    )))
}

/// Unpack the top-level entries named in `names` below `dest`. Returns the
/// number of entries written.
pub fn extract_entries(
    path: &Path,
    names: &BTreeSet<String>,
    dest: &Path,
) -> std::result::Result<usize, ArchiveError> {
    let fail = |reason: String| ArchiveError::IntegrityCheckFailed {
        path: path.to_path_buf(),
        reason,
    };

    std::fs::create_dir_all(dest)?;
    let file = std::fs::File::open(path)?;
    let decoder = zstd::Decoder::new(file).map_err(|e| fail(format!("zstd: {}", e)))?;
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);

    let mut extracted = 0usize;
    for entry in archive.entries().map_err(|e| fail(e.to_string()))? {
        let mut entry = entry.map_err(|e| fail(format!("corrupt entry: {}", e)))?;
        let entry_path = entry
            .path()
            .map_err(|e| fail(format!("bad entry path: {}", e)))?
            .into_owned();
        let Some(first) = top_level_name(&entry_path) else {
            return Err(fail(format!("unsafe entry path {}", entry_path.display())));
        };
        if !names.contains(&first) {
            continue;
        }
        if !entry.unpack_in(dest)? {
            return Err(fail(format!("entry {} escapes the destination", entry_path.display())));
        }
        extracted += 1;
    }
    Ok(extracted)
}

/// First component of a relative, non-escaping entry path.
fn top_level_name(path: &Path) -> Option<String> {
    let mut components = path.components();
    let first = match components.next()? {
        Component::Normal(name) => name.to_string_lossy().to_string(),
        _ => return None,
    };
    if components.any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
        return None;
    }
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_name() {
        assert_eq!(top_level_name(Path::new("grafana/grafana.db")), Some("grafana".to_string()));
        assert_eq!(top_level_name(Path::new("backup-metadata.json")), Some("backup-metadata.json".to_string()));
        assert_eq!(top_level_name(Path::new("/etc/passwd")), None);
        assert_eq!(top_level_name(Path::new("a/../../b")), None);
    }

    #[test]
    fn test_missing_file_fails() {
        let err = verify_archive(Path::new("/nonexistent/a.tar.zst"), None, None).unwrap_err();
        assert!(matches!(err, ArchiveError::IntegrityCheckFailed { .. }));
    }

    #[test]
    fn test_garbage_file_fails() -> std::io::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("garbage.tar.zst");
        std::fs::write(&path, b"definitely not zstd")?;
        let err = verify_archive(&path, None, None).unwrap_err();
        assert!(matches!(err, ArchiveError::IntegrityCheckFailed { .. }));
        Ok(())
    }
}

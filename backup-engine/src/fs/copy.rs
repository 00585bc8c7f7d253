//! Recursive copies used for staging, safety copies and replication.

use std::path::Path;
use walkdir::WalkDir;

use super::metadata::mode_of;

/// Copy `src` (file or directory) to `dest`, preserving permission bits and
/// recreating symlinks as links. Existing files under `dest` are overwritten.
pub fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<u64> {
    use std::os::unix::fs::PermissionsExt;

    let src_meta = std::fs::metadata(src)?;
    if src_meta.is_file() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        return std::fs::copy(src, dest);
    }

    let mut copied = 0u64;
    std::fs::create_dir_all(dest)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode_of(entry.path())?))?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            let _ = std::fs::remove_file(&target);
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            copied += std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(copied)
}

/// Remove everything inside `dir`, keeping the directory itself (and thus
/// its ownership and mount status).
pub fn clear_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        return std::fs::create_dir_all(dir);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Replace `path` with `content` through a hidden sibling and a rename, so
/// readers see the old file or the new one, never a partial write.
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let staged = path.with_file_name(format!(".{}.tmp", name));
    std::fs::write(&staged, content)?;
    std::fs::rename(&staged, path)
}

//! Directory traversal for archive sources and storage accounting.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Exclude patterns: an exact file name, or `*suffix`
    pub exclude_patterns: Vec<String>,
}

impl WalkOptions {
    pub fn excluding(patterns: &[String]) -> Self {
        Self {
            exclude_patterns: patterns.to_vec(),
            ..Self::default()
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Is this a directory?
    pub is_dir: bool,

    /// Is this a symlink?
    pub is_symlink: bool,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// Symlinks are kept as links (size 0); their targets are not followed.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let is_symlink = entry.path_is_symlink();

        Ok(Self {
            path,
            relative_path,
            size: if is_symlink { 0 } else { metadata.len() },
            is_dir: metadata.is_dir(),
            is_symlink,
        })
    }
}

/// Walk a directory tree and collect every file, directory and symlink
/// below `root` (the root itself is not included). A plain file as `root`
/// yields a single entry named after the file.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_directory_with_callback(root, options, |f| files.push(f.clone()))?;
    Ok(files)
}

/// Walk a directory tree with a callback for each entry
pub fn walk_directory_with_callback<F>(
    root: &Path,
    options: &WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(&FileInfo),
{
    let root_meta = std::fs::metadata(root)?;
    if root_meta.is_file() {
        let name = root.file_name().map(PathBuf::from).unwrap_or_default();
        callback(&FileInfo {
            path: root.to_path_buf(),
            relative_path: name,
            size: root_meta.len(),
            is_dir: false,
            is_symlink: false,
        });
        return Ok(());
    }

    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .min_depth(1)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let patterns = &options.exclude_patterns;
    for entry in walker.into_iter().filter_entry(|e| !should_exclude(e, patterns)) {
        let entry = entry?;
        callback(&FileInfo::from_entry(&entry, root)?);
    }

    Ok(())
}

/// Calculate total size of all regular files below a path
pub fn calculate_total_size(root: &Path, options: &WalkOptions) -> std::io::Result<u64> {
    let mut total_size = 0u64;

    walk_directory_with_callback(root, options, |file| {
        if !file.is_dir {
            total_size += file.size;
        }
    })?;

    Ok(total_size)
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| match pattern.strip_prefix('*') {
        Some(suffix) => file_name.ends_with(suffix),
        None => file_name == pattern.as_str(),
    })
}

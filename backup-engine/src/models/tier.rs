use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ── CompressionMode ──

/// Compression profile of a tier. Both modes produce zstd-compressed tar
/// streams; only the level differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    /// Low ratio, low latency. Used by frequent tiers.
    #[default]
    Fast,
    /// High ratio, slow. Used by infrequent, space-sensitive tiers.
    High,
}

impl CompressionMode {
    pub fn zstd_level(&self) -> i32 {
        match self {
            CompressionMode::Fast => 3,
            CompressionMode::High => 19,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMode::Fast => "fast",
            CompressionMode::High => "high",
        }
    }
}

/// File extension shared by every archive.
pub const ARCHIVE_EXTENSION: &str = ".tar.zst";

// ── ExportKind ──

/// Kinds of configuration documents exported from the dashboard service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportKind {
    Folders,
    Datasources,
    Dashboards,
    AlertRules,
}

impl ExportKind {
    /// Import order: folders before the documents that live in them, data
    /// sources before the dashboards and rules that query them.
    pub const ALL: [ExportKind; 4] = [
        ExportKind::Folders,
        ExportKind::Datasources,
        ExportKind::Dashboards,
        ExportKind::AlertRules,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            ExportKind::Folders => "folders",
            ExportKind::Datasources => "datasources",
            ExportKind::Dashboards => "dashboards",
            ExportKind::AlertRules => "alert_rules",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.dir_name() == name)
    }
}

// ── SourceSpec ──

/// One thing to include in a tier's archive.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    /// Top-level entry name inside the archive.
    pub name: String,
    pub mandatory: bool,
    pub kind: SourceKind,
    /// Optional command run inside a service before capture.
    pub pre_exec: Option<PreExec>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceKind {
    /// A host filesystem path (file or directory).
    Path { path: PathBuf },
    /// A named storage volume copied out through the container runtime,
    /// optionally with its owning service stopped for the copy.
    Volume {
        volume: String,
        subpath: Option<String>,
        quiesce: Option<String>,
    },
    /// A crash-consistent snapshot of the time-series database.
    Snapshot,
    /// Configuration documents exported over the dashboard service API.
    Export { kinds: Vec<ExportKind> },
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Path { .. } => "path",
            SourceKind::Volume { .. } => "volume",
            SourceKind::Snapshot => "snapshot",
            SourceKind::Export { .. } => "export",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreExec {
    pub service: String,
    pub command: Vec<String>,
}

// ── BackupTier ──

/// A named backup policy. Built once from configuration and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupTier {
    pub name: String,
    /// Cron expression (seconds field first).
    pub schedule: String,
    pub retention: Duration,
    pub compression: CompressionMode,
    /// Latest archive older than this degrades health to warning.
    pub warn_after: Duration,
    /// Latest archive older than this (or no archive at all) is critical.
    pub critical_after: Duration,
    pub sources: Vec<SourceSpec>,
}

impl BackupTier {
    pub fn source(&self, name: &str) -> Option<&SourceSpec> {
        self.sources.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_levels() {
        assert!(CompressionMode::High.zstd_level() > CompressionMode::Fast.zstd_level());
        assert_eq!(CompressionMode::default(), CompressionMode::Fast);
    }

    #[test]
    fn test_export_kind_dir_names_round_trip() {
        for kind in ExportKind::ALL {
            assert_eq!(ExportKind::from_dir_name(kind.dir_name()), Some(kind));
        }
        assert_eq!(ExportKind::from_dir_name("plugins"), None);
    }
}

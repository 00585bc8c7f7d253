use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::tier::CompressionMode;

/// Name of the metadata document embedded at the top level of every archive.
pub const EMBEDDED_METADATA: &str = "backup-metadata.json";

// ── BackupMetadata ──

/// Immutable record written once alongside (and inside) each archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub tier: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub hostname: String,
    pub compression: CompressionMode,
    pub sources: Vec<SourceInclusion>,
    /// Uncompressed bytes of all included sources.
    pub total_bytes: u64,
    /// Source-control revision of the deployment at backup time.
    pub revision: Option<String>,
}

impl BackupMetadata {
    /// Top-level entries the archive must contain.
    pub fn expected_entries(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter(|s| s.included)
            .map(|s| s.name.clone())
            .chain(std::iter::once(EMBEDDED_METADATA.to_string()))
            .collect()
    }
}

/// Per-source inclusion flag with the reason a source was left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInclusion {
    pub name: String,
    pub kind: String,
    pub included: bool,
    pub mandatory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub bytes: u64,
}

// ── Archive ──

/// One immutable output of a backup run. Serialized as the
/// `<archive>.meta.json` sidecar; `path` is filled in when loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    #[serde(skip)]
    pub path: PathBuf,
    pub file_name: String,
    pub tier: String,
    pub created_at: DateTime<Utc>,
    pub compression: CompressionMode,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the archive file.
    pub digest: String,
    pub metadata: BackupMetadata,
}

impl Archive {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    pub fn short_digest(&self) -> &str {
        &self.digest[..self.digest.len().min(12)]
    }
}

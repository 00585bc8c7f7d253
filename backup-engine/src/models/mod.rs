//! Typed data model shared by every component.

pub mod archive;
pub mod tier;

pub use archive::{Archive, BackupMetadata, SourceInclusion, EMBEDDED_METADATA};
pub use tier::{
    BackupTier, CompressionMode, ExportKind, PreExec, SourceKind, SourceSpec, ARCHIVE_EXTENSION,
};

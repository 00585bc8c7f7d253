//! Utility modules for the backup engine.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{ArchiveError, EngineError, RestoreError, Result, SnapshotError};
pub use format::{format_age, format_bytes, format_duration_ms};

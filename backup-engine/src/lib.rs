//! Backup Engine Library
//!
//! Tiered backup, integrity checking and restore for a self-hosted
//! observability stack. Archives are zstd-compressed tarballs with embedded
//! metadata, published atomically per tier and replicated to secondary
//! storage.

pub mod adapters;
pub mod archive;
pub mod config;
pub mod context;
pub mod executor;
pub mod fs;
pub mod health;
pub mod hooks;
pub mod layout;
pub mod lock;
pub mod models;
pub mod replication;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod snapshot;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use context::EngineContext;
pub use executor::{BackupExecutor, RunReport, TriggerResult};
pub use health::{HealthMonitor, HealthReport, Severity};
pub use restore::{ArchiveRef, AssumeYes, Confirmer, RestoreCoordinator, RestorePlan, RestoreReport};
pub use utils::errors::{ArchiveError, EngineError, RestoreError, Result, SnapshotError};

//! Error types for the backup engine.
//!
//! `EngineError` covers infrastructure failures shared by every component.
//! The per-operation enums below mirror the component contracts so callers
//! can match on the outcome class (skip, warning, abort) instead of strings.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Secret resolution failed for {reference}: {reason}")]
    Secret { reference: String, reason: String },

    #[error("Runtime command failed: {0}")]
    Runtime(String),

    #[error("Live-state lock unavailable: {0}")]
    Lock(String),

    #[error("Unknown tier: {0}")]
    UnknownTier(String),

    #[error("Task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failures of the time-series database snapshot adapter.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The admin API is switched off; callers skip the source for this run.
    #[error("Snapshot admin API is disabled")]
    AdminApiDisabled,

    #[error("Snapshot request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to copy snapshot {handle}: {reason}")]
    CopyFailed { handle: String, reason: String },

    #[error("Failed to discard snapshot {handle}: {reason}")]
    CleanupFailed { handle: String, reason: String },
}

/// Failures of the archive builder and verifier.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Source {source_name} unreadable: {reason}")]
    SourceUnreadable { source_name: String, reason: String },

    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Integrity check failed for {path}: {reason}")]
    IntegrityCheckFailed { path: PathBuf, reason: String },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<std::io::Error> for ArchiveError {
    fn from(e: std::io::Error) -> Self {
        ArchiveError::Engine(EngineError::Io(e))
    }
}

/// Failures of a restore invocation. Every variant raised after live state
/// was touched names the safety copy so the operator can roll back.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("Integrity check failed for {path}: {reason}")]
    IntegrityCheckFailed { path: PathBuf, reason: String },

    #[error("Restore aborted by operator")]
    Aborted,

    #[error("Scope {0} has no configured restore target")]
    UnknownScope(String),

    #[error("Failed to restart {service}: {reason} (safety copy: {safety_copy})")]
    ServiceRestartFailed {
        service: String,
        reason: String,
        safety_copy: String,
    },

    #[error("Restore of {target} failed: {reason} (safety copy: {safety_copy})")]
    ReplaceFailed {
        target: String,
        reason: String,
        safety_copy: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<std::io::Error> for RestoreError {
    fn from(e: std::io::Error) -> Self {
        RestoreError::Engine(EngineError::Io(e))
    }
}

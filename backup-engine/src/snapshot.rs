//! Time-series database snapshots taken through its admin API.
//!
//! A snapshot is a hard-linked, consistent copy of the database's blocks
//! created inside the database's own data volume. It is copied out to
//! staging for the archive and then deleted so snapshots do not pile up.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::adapters::ServiceRuntime;
use crate::config::SnapshotConfig;
use crate::utils::errors::SnapshotError;

/// Opaque name of a snapshot directory inside the database volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub name: String,
}

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn create_snapshot(&self) -> Result<SnapshotHandle, SnapshotError>;

    /// Copy the snapshot's files into `dest`.
    async fn materialize(&self, handle: &SnapshotHandle, dest: &Path) -> Result<(), SnapshotError>;

    /// Delete the snapshot from the database volume.
    async fn discard(&self, handle: &SnapshotHandle) -> Result<(), SnapshotError>;
}

/// Prometheus-style `POST /api/v1/admin/tsdb/snapshot`.
pub struct TsdbSnapshotProvider {
    client: reqwest::Client,
    config: SnapshotConfig,
    runtime: Arc<dyn ServiceRuntime>,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    status: String,
    data: Option<SnapshotData>,
}

#[derive(Debug, Deserialize)]
struct SnapshotData {
    name: String,
}

impl TsdbSnapshotProvider {
    pub fn new(config: SnapshotConfig, runtime: Arc<dyn ServiceRuntime>) -> Result<Self, SnapshotError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SnapshotError::RequestFailed(e.to_string()))?;
        Ok(Self {
            client,
            config,
            runtime,
        })
    }

    fn snapshot_subpath(&self, handle: &SnapshotHandle) -> String {
        format!("{}/{}", self.config.snapshot_dir.trim_matches('/'), handle.name)
    }
}

#[async_trait]
impl SnapshotProvider for TsdbSnapshotProvider {
    async fn create_snapshot(&self) -> Result<SnapshotHandle, SnapshotError> {
        let url = format!(
            "{}/api/v1/admin/tsdb/snapshot",
            self.config.admin_url.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| SnapshotError::RequestFailed(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| SnapshotError::RequestFailed(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(classify_failure(status, &body));
        }

        let handle = parse_snapshot_response(&body)?;
        info!(snapshot = %handle.name, "Database snapshot created");
        Ok(handle)
    }

    async fn materialize(&self, handle: &SnapshotHandle, dest: &Path) -> Result<(), SnapshotError> {
        self.runtime
            .copy_from_volume(&self.config.volume, Some(&self.snapshot_subpath(handle)), dest)
            .await
            .map_err(|e| SnapshotError::CopyFailed {
                handle: handle.name.clone(),
                reason: e.to_string(),
            })
    }

    async fn discard(&self, handle: &SnapshotHandle) -> Result<(), SnapshotError> {
        self.runtime
            .remove_from_volume(&self.config.volume, &self.snapshot_subpath(handle))
            .await
            .map_err(|e| {
                warn!(snapshot = %handle.name, error = %e, "Snapshot left behind in database volume");
                SnapshotError::CleanupFailed {
                    handle: handle.name.clone(),
                    reason: e.to_string(),
                }
            })
    }
}

/// Map a non-2xx answer. A disabled admin API (endpoint not routed, or the
/// server's own "admin APIs disabled" message) is told apart from every
/// other failure so the caller can skip instead of fail.
pub fn classify_failure(status: u16, body: &str) -> SnapshotError {
    let disabled_body = body.to_ascii_lowercase().contains("admin apis disabled");
    match status {
        404 | 405 => SnapshotError::AdminApiDisabled,
        _ if disabled_body => SnapshotError::AdminApiDisabled,
        _ => SnapshotError::RequestFailed(format!("HTTP {}: {}", status, body.trim())),
    }
}

fn parse_snapshot_response(body: &str) -> Result<SnapshotHandle, SnapshotError> {
    let parsed: SnapshotResponse = serde_json::from_str(body)
        .map_err(|e| SnapshotError::RequestFailed(format!("unexpected response: {}", e)))?;

    if parsed.status != "success" {
        return Err(SnapshotError::RequestFailed(format!("status {}", parsed.status)));
    }

    let name = parsed
        .data
        .map(|d| d.name)
        .ok_or_else(|| SnapshotError::RequestFailed("response has no snapshot name".to_string()))?;

    if name.is_empty() || name.contains('/') || name.contains("..") {
        return Err(SnapshotError::RequestFailed(format!("invalid snapshot name `{}`", name)));
    }

    Ok(SnapshotHandle { name })
}

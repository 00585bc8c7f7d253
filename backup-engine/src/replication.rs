//! Mirrors finished archives to secondary storage.
//!
//! Targets are opportunistic: an unreachable target is a skip, never an
//! error, and replication only ever copies. A copy counts once the digest
//! read back from the destination matches the local archive.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::adapters::SecretsProvider;
use crate::archive::digest::{sha256_file, StreamDigest};
use crate::config::{ObjectStoreConfig, SecondaryConfig};
use crate::layout::ArtifactLayout;
use crate::models::Archive;
use crate::utils::errors::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplicationResult {
    Replicated { target: String, location: String, bytes: u64 },
    Skipped { target: String, reason: String },
    Failed { target: String, reason: String },
}

impl ReplicationResult {
    pub fn target(&self) -> &str {
        match self {
            ReplicationResult::Replicated { target, .. }
            | ReplicationResult::Skipped { target, .. }
            | ReplicationResult::Failed { target, .. } => target,
        }
    }
}

#[async_trait]
pub trait StorageTarget: Send + Sync {
    fn name(&self) -> &str;

    /// `Err(reason)` when the target cannot be used right now.
    async fn check_reachable(&self) -> std::result::Result<(), String>;

    /// Copy the archive and verify it at the destination. Returns the
    /// destination location.
    async fn upload(&self, archive: &Archive) -> Result<String>;
}

pub struct ReplicationManager {
    targets: Vec<Arc<dyn StorageTarget>>,
}

impl ReplicationManager {
    pub fn new(targets: Vec<Arc<dyn StorageTarget>>) -> Self {
        Self { targets }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub async fn replicate(&self, archive: &Archive) -> Vec<ReplicationResult> {
        let mut results = Vec::with_capacity(self.targets.len());

        for target in &self.targets {
            let name = target.name().to_string();
            if let Err(reason) = target.check_reachable().await {
                info!(target = %name, %reason, "Replication target unavailable, skipping");
                results.push(ReplicationResult::Skipped { target: name, reason });
                continue;
            }

            match target.upload(archive).await {
                Ok(location) => {
                    info!(target = %name, %location, "Archive replicated");
                    results.push(ReplicationResult::Replicated {
                        target: name,
                        location,
                        bytes: archive.size_bytes,
                    });
                }
                Err(e) => {
                    warn!(target = %name, error = %e, "Replication failed");
                    results.push(ReplicationResult::Failed {
                        target: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        results
    }
}

// ── Secondary mount ──

/// A removable disk mounted at a fixed path.
pub struct SecondaryMount {
    path: PathBuf,
    require_mount: bool,
}

impl SecondaryMount {
    pub fn new(config: &SecondaryConfig) -> Self {
        Self {
            path: config.path.clone(),
            require_mount: config.require_mount,
        }
    }
}

/// A directory is a mount point when it lives on a different device than
/// its parent. An unmounted mount point is just an empty directory on the
/// root filesystem, which must not receive archives.
pub fn is_mount_point(path: &Path) -> std::io::Result<bool> {
    let own = std::fs::metadata(path)?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::metadata(parent)?,
        _ => return Ok(true),
    };
    Ok(own.dev() != parent.dev() || own.ino() == parent.ino())
}

#[async_trait]
impl StorageTarget for SecondaryMount {
    fn name(&self) -> &str {
        "secondary"
    }

    async fn check_reachable(&self) -> std::result::Result<(), String> {
        let path = self.path.clone();
        let require_mount = self.require_mount;
        tokio::task::spawn_blocking(move || {
            if !path.is_dir() {
                return Err(format!("{} is not present", path.display()));
            }
            if require_mount && !is_mount_point(&path).map_err(|e| e.to_string())? {
                return Err(format!("{} is not mounted", path.display()));
            }
            Ok(())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn upload(&self, archive: &Archive) -> Result<String> {
        let dest_dir = self.path.join(&archive.tier);
        let archive = archive.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dest_dir)?;
            let dest = dest_dir.join(&archive.file_name);
            let staged = ArtifactLayout::temp_path(&dest);

            std::fs::copy(&archive.path, &staged)?;
            let digest = sha256_file(&staged)?;
            if digest != archive.digest {
                let _ = std::fs::remove_file(&staged);
                return Err(EngineError::Runtime(format!(
                    "digest mismatch at {} (expected {}, found {})",
                    dest.display(),
                    archive.digest,
                    digest
                )));
            }
            std::fs::rename(&staged, &dest)?;

            let sidecar = ArtifactLayout::sidecar_path(&archive.path);
            if sidecar.is_file() {
                std::fs::copy(&sidecar, ArtifactLayout::sidecar_path(&dest))?;
            }
            Ok(dest.display().to_string())
        })
        .await?
    }
}

// ── Object store ──

/// S3-compatible bucket addressed by path (`{endpoint}/{bucket}/{key}`),
/// authenticated with a bearer token.
pub struct ObjectStoreTarget {
    client: reqwest::Client,
    config: ObjectStoreConfig,
    secrets: Arc<dyn SecretsProvider>,
}

impl ObjectStoreTarget {
    pub fn new(config: ObjectStoreConfig, secrets: Arc<dyn SecretsProvider>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            secrets,
        })
    }

    fn object_url(&self, archive: &Archive) -> String {
        format!(
            "{}/{}/{}{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.bucket,
            self.config.prefix,
            archive.tier,
            archive.file_name
        )
    }

    async fn authorize(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        match &self.config.token_ref {
            Some(token_ref) => {
                let token = self.secrets.resolve(token_ref).await?;
                Ok(builder.bearer_auth(token.expose()))
            }
            None => Ok(builder),
        }
    }
}

#[async_trait]
impl StorageTarget for ObjectStoreTarget {
    fn name(&self) -> &str {
        "object_store"
    }

    async fn check_reachable(&self) -> std::result::Result<(), String> {
        // Any HTTP answer means the endpoint is up; only transport errors skip.
        self.client
            .head(&self.config.endpoint)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn upload(&self, archive: &Archive) -> Result<String> {
        let url = self.object_url(archive);

        let file = tokio::fs::File::open(&archive.path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let request = self
            .authorize(
                self.client
                    .put(&url)
                    .header(reqwest::header::CONTENT_LENGTH, archive.size_bytes)
                    .body(body),
            )
            .await?;
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(EngineError::Runtime(format!("PUT {} returned {}", url, response.status())));
        }

        let response = self.authorize(self.client.get(&url)).await?.send().await?;
        if !response.status().is_success() {
            return Err(EngineError::Runtime(format!("GET {} returned {}", url, response.status())));
        }
        let mut digest = StreamDigest::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            digest.update(&chunk?);
        }
        let remote = digest.finish();
        if remote != archive.digest {
            return Err(EngineError::Runtime(format!(
                "digest mismatch at {} (expected {}, found {})",
                url, archive.digest, remote
            )));
        }

        Ok(url)
    }
}

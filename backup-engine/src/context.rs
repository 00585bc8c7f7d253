//! Wiring of configuration and collaborator adapters shared by the
//! executor, the health monitor and the restore coordinator.

use std::sync::Arc;

use crate::adapters::{ConfigApi, DefaultSecrets, DockerCli, HttpConfigApi, SecretsProvider, ServiceRuntime};
use crate::config::Config;
use crate::hooks::HookRunner;
use crate::layout::ArtifactLayout;
use crate::lock::LiveStateLock;
use crate::replication::{ObjectStoreTarget, ReplicationManager, SecondaryMount, StorageTarget};
use crate::scheduler::TierScheduler;
use crate::snapshot::{SnapshotProvider, TsdbSnapshotProvider};
use crate::utils::errors::{EngineError, Result};

pub struct EngineContext {
    pub config: Config,
    pub layout: ArtifactLayout,
    pub runtime: Arc<dyn ServiceRuntime>,
    pub snapshots: Option<Arc<dyn SnapshotProvider>>,
    pub config_api: Option<Arc<dyn ConfigApi>>,
    pub secrets: Arc<dyn SecretsProvider>,
    pub targets: Vec<Arc<dyn StorageTarget>>,
    pub scheduler: TierScheduler,
    /// Client for readiness probes.
    pub http: reqwest::Client,
}

/// Collaborators a context is assembled from.
pub struct Adapters {
    pub runtime: Arc<dyn ServiceRuntime>,
    pub snapshots: Option<Arc<dyn SnapshotProvider>>,
    pub config_api: Option<Arc<dyn ConfigApi>>,
    pub secrets: Arc<dyn SecretsProvider>,
    pub targets: Vec<Arc<dyn StorageTarget>>,
}

impl EngineContext {
    /// Build the production adapters described by `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let secrets: Arc<dyn SecretsProvider> =
            Arc::new(DefaultSecrets::new(config.secrets.command.clone()));
        let runtime: Arc<dyn ServiceRuntime> = Arc::new(DockerCli::new(&config.runtime));

        let snapshots: Option<Arc<dyn SnapshotProvider>> = match &config.snapshot {
            Some(snapshot) => Some(Arc::new(
                TsdbSnapshotProvider::new(snapshot.clone(), runtime.clone())
                    .map_err(|e| EngineError::Config(e.to_string()))?,
            )),
            None => None,
        };

        let config_api: Option<Arc<dyn ConfigApi>> = match &config.config_api {
            Some(api) => Some(Arc::new(HttpConfigApi::new(api.clone(), secrets.clone())?)),
            None => None,
        };

        let mut targets: Vec<Arc<dyn StorageTarget>> = Vec::new();
        if let Some(secondary) = &config.storage.secondary {
            targets.push(Arc::new(SecondaryMount::new(secondary)));
        }
        if let Some(object_store) = &config.storage.object_store {
            targets.push(Arc::new(ObjectStoreTarget::new(object_store.clone(), secrets.clone())?));
        }

        Self::with_adapters(
            config,
            Adapters {
                runtime,
                snapshots,
                config_api,
                secrets,
                targets,
            },
        )
    }

    pub fn with_adapters(config: Config, adapters: Adapters) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.health.probe_timeout)
            .build()?;

        Ok(Self {
            layout: ArtifactLayout::new(&config.storage.root),
            scheduler: TierScheduler::new(config.tiers.iter().map(|t| t.name.clone())),
            runtime: adapters.runtime,
            snapshots: adapters.snapshots,
            config_api: adapters.config_api,
            secrets: adapters.secrets,
            targets: adapters.targets,
            http,
            config,
        })
    }

    pub fn live_lock(&self) -> LiveStateLock {
        LiveStateLock::new(self.layout.lock_path(), self.config.storage.lock_timeout)
    }

    pub fn hook_runner(&self) -> HookRunner {
        HookRunner::new(
            self.runtime.clone(),
            self.snapshots.clone(),
            self.config_api.clone(),
            self.layout.clone(),
            self.live_lock(),
        )
    }

    pub fn replication(&self) -> ReplicationManager {
        ReplicationManager::new(self.targets.clone())
    }
}

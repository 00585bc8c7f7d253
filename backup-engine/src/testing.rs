//! In-process stand-ins for the container runtime, the snapshot API and the
//! config API. Volumes are plain directories under a temp dir.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::adapters::{ConfigApi, DefaultSecrets, ItemRef, ServiceRuntime};
use crate::config::tests::SAMPLE;
use crate::config::{Config, SecondaryConfig};
use crate::context::{Adapters, EngineContext};
use crate::fs::{clear_dir, copy_tree};
use crate::models::ExportKind;
use crate::replication::{SecondaryMount, StorageTarget};
use crate::snapshot::{SnapshotHandle, SnapshotProvider};
use crate::utils::errors::{EngineError, Result, SnapshotError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Stop(String),
    Start(String),
    Exec(String, Vec<String>),
    CopyFrom(String),
    CopyInto(String),
    Clear(String),
    Remove(String, String),
    Chown(String, String),
}

pub struct FakeRuntime {
    dir: TempDir,
    running: Mutex<HashMap<String, bool>>,
    calls: Mutex<Vec<RuntimeCall>>,
    failing_copies: Mutex<HashSet<String>>,
    failing_starts: Mutex<HashSet<String>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("temp dir"),
            running: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failing_copies: Mutex::new(HashSet::new()),
            failing_starts: Mutex::new(HashSet::new()),
        }
    }

    pub fn volume_path(&self, volume: &str) -> PathBuf {
        self.dir.path().join("volumes").join(volume)
    }

    /// Create (or extend) a volume with `(relative path, content)` files.
    pub fn add_volume(&self, volume: &str, files: &[(&str, &str)]) {
        let root = self.volume_path(volume);
        std::fs::create_dir_all(&root).unwrap();
        for (path, content) in files {
            let file = root.join(path);
            std::fs::create_dir_all(file.parent().unwrap()).unwrap();
            std::fs::write(file, content).unwrap();
        }
    }

    pub fn set_running(&self, container: &str, running: bool) {
        self.running.lock().unwrap().insert(container.to_string(), running);
    }

    pub fn is_running_now(&self, container: &str) -> bool {
        self.running.lock().unwrap().get(container).copied().unwrap_or(false)
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_copy_from(&self, volume: &str) {
        self.failing_copies.lock().unwrap().insert(volume.to_string());
    }

    pub fn fail_start(&self, container: &str) {
        self.failing_starts.lock().unwrap().insert(container.to_string());
    }

    fn record(&self, call: RuntimeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

fn fake_error(message: String) -> EngineError {
    EngineError::Runtime(message)
}

#[async_trait]
impl ServiceRuntime for FakeRuntime {
    async fn stop(&self, container: &str) -> Result<()> {
        self.record(RuntimeCall::Stop(container.to_string()));
        self.set_running(container, false);
        Ok(())
    }

    async fn start(&self, container: &str) -> Result<()> {
        self.record(RuntimeCall::Start(container.to_string()));
        if self.failing_starts.lock().unwrap().contains(container) {
            return Err(fake_error(format!("{} refused to start", container)));
        }
        self.set_running(container, true);
        Ok(())
    }

    async fn is_running(&self, container: &str) -> Result<bool> {
        Ok(self.is_running_now(container))
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<String> {
        self.record(RuntimeCall::Exec(container.to_string(), command.to_vec()));
        if !self.is_running_now(container) {
            return Err(fake_error(format!("container {} is not running", container)));
        }
        Ok(String::new())
    }

    async fn copy_from_volume(&self, volume: &str, subpath: Option<&str>, dest: &Path) -> Result<()> {
        self.record(RuntimeCall::CopyFrom(volume.to_string()));
        if self.failing_copies.lock().unwrap().contains(volume) {
            return Err(fake_error(format!("volume {} is unreadable", volume)));
        }
        let mut src = self.volume_path(volume);
        if let Some(subpath) = subpath {
            src = src.join(subpath);
        }
        if !src.exists() {
            return Err(fake_error(format!("no such volume path {}", src.display())));
        }
        copy_tree(&src, dest)?;
        Ok(())
    }

    async fn copy_into_volume(&self, src: &Path, volume: &str) -> Result<()> {
        self.record(RuntimeCall::CopyInto(volume.to_string()));
        copy_tree(src, &self.volume_path(volume))?;
        Ok(())
    }

    async fn clear_volume(&self, volume: &str) -> Result<()> {
        self.record(RuntimeCall::Clear(volume.to_string()));
        clear_dir(&self.volume_path(volume))?;
        Ok(())
    }

    async fn remove_from_volume(&self, volume: &str, subpath: &str) -> Result<()> {
        self.record(RuntimeCall::Remove(volume.to_string(), subpath.to_string()));
        let path = self.volume_path(volume).join(subpath);
        if path.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    async fn chown_volume(&self, volume: &str, owner: &str) -> Result<()> {
        self.record(RuntimeCall::Chown(volume.to_string(), owner.to_string()));
        Ok(())
    }
}

/// Snapshots are directories under `snapshots/` in the fake volume.
pub struct FakeSnapshots {
    runtime: Arc<FakeRuntime>,
    volume: String,
    disabled: Mutex<bool>,
    failing_materialize: Mutex<bool>,
    created: AtomicUsize,
}

impl FakeSnapshots {
    pub fn new(runtime: Arc<FakeRuntime>, volume: &str) -> Self {
        runtime.add_volume(volume, &[("wal/00000001", "wal")]);
        Self {
            runtime,
            volume: volume.to_string(),
            disabled: Mutex::new(false),
            failing_materialize: Mutex::new(false),
            created: AtomicUsize::new(0),
        }
    }

    pub fn set_disabled(&self, disabled: bool) {
        *self.disabled.lock().unwrap() = disabled;
    }

    pub fn fail_materialize(&self, fail: bool) {
        *self.failing_materialize.lock().unwrap() = fail;
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Snapshots still present in the volume.
    pub fn live_snapshots(&self) -> usize {
        std::fs::read_dir(self.runtime.volume_path(&self.volume).join("snapshots"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SnapshotProvider for FakeSnapshots {
    async fn create_snapshot(&self) -> std::result::Result<SnapshotHandle, SnapshotError> {
        if *self.disabled.lock().unwrap() {
            return Err(SnapshotError::AdminApiDisabled);
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let name = format!("20261019T020000Z-{:04}", n);
        self.runtime.add_volume(
            &self.volume,
            &[(&format!("snapshots/{}/01HBLOCK/chunks/000001", name), "chunk")],
        );
        Ok(SnapshotHandle { name })
    }

    async fn materialize(&self, handle: &SnapshotHandle, dest: &Path) -> std::result::Result<(), SnapshotError> {
        let copy_failed = |reason: String| SnapshotError::CopyFailed {
            handle: handle.name.clone(),
            reason,
        };
        if *self.failing_materialize.lock().unwrap() {
            return Err(copy_failed("injected failure".to_string()));
        }
        self.runtime
            .copy_from_volume(&self.volume, Some(&format!("snapshots/{}", handle.name)), dest)
            .await
            .map_err(|e| copy_failed(e.to_string()))
    }

    async fn discard(&self, handle: &SnapshotHandle) -> std::result::Result<(), SnapshotError> {
        self.runtime
            .remove_from_volume(&self.volume, &format!("snapshots/{}", handle.name))
            .await
            .map_err(|e| SnapshotError::CleanupFailed {
                handle: handle.name.clone(),
                reason: e.to_string(),
            })
    }
}

#[derive(Default)]
pub struct FakeConfigApi {
    items: Mutex<BTreeMap<(ExportKind, String), Value>>,
    failing_gets: Mutex<HashSet<String>>,
    failing_imports: Mutex<HashSet<String>>,
    imported: Mutex<Vec<(ExportKind, Value)>>,
}

impl FakeConfigApi {
    pub fn insert(&self, kind: ExportKind, id: &str, document: Value) {
        self.items.lock().unwrap().insert((kind, id.to_string()), document);
    }

    pub fn fail_get(&self, id: &str) {
        self.failing_gets.lock().unwrap().insert(id.to_string());
    }

    /// Reject imports of documents whose JSON text contains `marker`.
    pub fn fail_import(&self, marker: &str) {
        self.failing_imports.lock().unwrap().insert(marker.to_string());
    }

    pub fn imported(&self) -> Vec<(ExportKind, Value)> {
        self.imported.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfigApi for FakeConfigApi {
    async fn list(&self, kind: ExportKind) -> Result<Vec<ItemRef>> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| ItemRef {
                id: id.clone(),
                title: Some(id.clone()),
            })
            .collect())
    }

    async fn get(&self, kind: ExportKind, id: &str) -> Result<Value> {
        if self.failing_gets.lock().unwrap().contains(id) {
            return Err(fake_error(format!("GET {} returned 500", id)));
        }
        self.items
            .lock()
            .unwrap()
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or_else(|| fake_error(format!("{} not found", id)))
    }

    async fn import(&self, kind: ExportKind, document: &Value) -> Result<()> {
        let text = document.to_string();
        if self.failing_imports.lock().unwrap().iter().any(|m| text.contains(m.as_str())) {
            return Err(fake_error("import rejected with 400".to_string()));
        }
        self.imported.lock().unwrap().push((kind, document.clone()));
        Ok(())
    }
}

/// A context over the sample configuration with every collaborator faked
/// and every path inside one temp dir.
pub struct Fakes {
    pub dir: TempDir,
    pub ctx: Arc<EngineContext>,
    pub runtime: Arc<FakeRuntime>,
    pub snapshots: Arc<FakeSnapshots>,
    pub api: Arc<FakeConfigApi>,
}

pub fn sample_config(root: &Path) -> Config {
    let mut config = Config::from_toml_str(SAMPLE).unwrap();
    config.storage.root = root.join("backups");
    config.storage.secondary = Some(SecondaryConfig {
        path: root.join("usb"),
        require_mount: true,
    });
    config.storage.lock_timeout = Duration::from_secs(2);
    config.revision_dir = None;

    let stack_config = root.join("stack/config");
    std::fs::create_dir_all(&stack_config).unwrap();
    std::fs::write(stack_config.join("prometheus.yml"), "scrape_configs: []\n").unwrap();
    std::fs::write(stack_config.join("scratch.tmp"), "x").unwrap();
    for tier in &mut config.tiers {
        for source in &mut tier.sources {
            if source.name == "stack-config" {
                source.path = Some(stack_config.clone());
            }
        }
    }

    // Readiness falls back to the runtime's running state.
    for service in config.services.values_mut() {
        service.readiness_url = None;
    }
    config.restore.readiness_timeout = Duration::from_millis(500);
    config.restore.poll_interval = Duration::from_millis(50);
    config
}

pub fn context_with_fakes() -> Fakes {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("usb")).unwrap();
    let config = sample_config(dir.path());
    context_from(dir, config)
}

pub fn context_from(dir: TempDir, config: Config) -> Fakes {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_volume("grafana-data", &[("grafana.db", "sqlite"), ("plugins/README", "plugins")]);
    runtime.set_running("obs-grafana", true);
    runtime.set_running("obs-prometheus", true);

    let snapshots = Arc::new(FakeSnapshots::new(runtime.clone(), "prometheus-data"));

    let api = Arc::new(FakeConfigApi::default());
    api.insert(ExportKind::Folders, "ops", serde_json::json!({"uid": "ops", "title": "Ops"}));
    api.insert(
        ExportKind::Dashboards,
        "overview",
        serde_json::json!({"dashboard": {"uid": "overview", "title": "Overview"}, "meta": {"folderUid": "ops"}}),
    );

    let targets: Vec<Arc<dyn StorageTarget>> = config
        .storage
        .secondary
        .iter()
        .map(|s| Arc::new(SecondaryMount::new(s)) as Arc<dyn StorageTarget>)
        .collect();

    let ctx = EngineContext::with_adapters(
        config,
        Adapters {
            runtime: runtime.clone(),
            snapshots: Some(snapshots.clone()),
            config_api: Some(api.clone()),
            secrets: Arc::new(DefaultSecrets::new(Vec::new())),
            targets,
        },
    )
    .unwrap();

    Fakes {
        dir,
        ctx: Arc::new(ctx),
        runtime,
        snapshots,
        api,
    }
}

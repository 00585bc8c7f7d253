//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`OBS_BACKUP__SECTION__KEY`), then validates it into the typed tier model.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{BackupTier, CompressionMode, ExportKind, PreExec, SourceKind, SourceSpec};
use crate::utils::errors::{EngineError, Result};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "OBS_BACKUP";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub tiers: Vec<TierConfig>,

    /// Services of the stack, keyed by logical name.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,

    #[serde(default)]
    pub snapshot: Option<SnapshotConfig>,

    #[serde(default)]
    pub config_api: Option<ConfigApiConfig>,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub restore: RestoreConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Git checkout whose HEAD is recorded in backup metadata
    #[serde(default)]
    pub revision_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the artifact layout (archives, exports, logs, safety copies)
    pub root: PathBuf,

    /// Removable secondary location
    #[serde(default)]
    pub secondary: Option<SecondaryConfig>,

    /// Remote object-store tier
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,

    /// Maximum wait for the live-state lock
    #[serde(default = "default_lock_timeout", with = "duration_str")]
    pub lock_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryConfig {
    pub path: PathBuf,

    /// Only replicate when `path` is an actual mount point
    #[serde(default = "default_true")]
    pub require_mount: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Base URL, e.g. `https://s3.example.net`
    pub endpoint: String,
    pub bucket: String,

    #[serde(default)]
    pub prefix: String,

    /// Secret reference for a bearer token
    #[serde(default)]
    pub token_ref: Option<String>,

    #[serde(default = "default_transfer_timeout", with = "duration_str")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output (stdout, file)
    #[serde(default)]
    pub output: LogOutput,

    /// Directory for file output
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: LogOutput::default(),
            dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,

    /// Cron expression, seconds first (`0 0 2 * * *`)
    pub schedule: String,

    #[serde(with = "duration_str")]
    pub retention: Duration,

    #[serde(default)]
    pub compression: CompressionMode,

    #[serde(with = "duration_str")]
    pub warn_after: Duration,

    /// Defaults to twice `warn_after`
    #[serde(default, with = "opt_duration_str")]
    pub critical_after: Option<Duration>,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKindConfig {
    Path,
    Volume,
    Snapshot,
    Export,
}

/// Flat on-disk shape of a source; validated into [`SourceSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKindConfig,

    #[serde(default)]
    pub mandatory: bool,

    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub volume: Option<String>,

    #[serde(default)]
    pub subpath: Option<String>,

    /// Service stopped while the volume is copied
    #[serde(default)]
    pub quiesce: Option<String>,

    #[serde(default)]
    pub exports: Vec<ExportKind>,

    /// Service and command run before capture
    #[serde(default)]
    pub exec_in: Option<String>,

    #[serde(default)]
    pub exec: Vec<String>,

    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Container name used by the runtime
    pub container: String,

    /// Readiness endpoint polled after restarts and by the health monitor
    #[serde(default)]
    pub readiness_url: Option<String>,

    /// Unreachable critical services make the health verdict critical
    #[serde(default = "default_true")]
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Base URL of the time-series database
    pub admin_url: String,

    /// Volume holding the database's data directory
    pub volume: String,

    /// Snapshot directory relative to the volume root
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,

    #[serde(default = "default_request_timeout", with = "duration_str")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigApiConfig {
    pub base_url: String,

    /// Secret reference of a bearer token
    #[serde(default)]
    pub token_ref: Option<String>,

    /// Basic-auth user, used when no token is configured
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password_ref: Option<String>,

    #[serde(default = "default_request_timeout", with = "duration_str")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecretsConfig {
    /// Command used for `cmd:` references; the reference is appended as the
    /// last argument (e.g. `["op", "read"]`).
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Monitor cadence in daemon mode
    #[serde(default = "default_health_interval", with = "duration_str")]
    pub interval: Duration,

    #[serde(default = "default_storage_warn_bytes")]
    pub storage_warn_bytes: u64,

    #[serde(default)]
    pub storage_critical_bytes: Option<u64>,

    /// Only run logs modified within this window are scanned
    #[serde(default = "default_log_window", with = "duration_str")]
    pub log_window: Duration,

    /// Warning lines tolerated before the log check degrades
    #[serde(default = "default_log_warn_threshold")]
    pub log_warn_threshold: usize,

    /// Exported documents parsed per tier
    #[serde(default = "default_export_sample")]
    pub export_sample: usize,

    #[serde(default = "default_probe_timeout", with = "duration_str")]
    pub probe_timeout: Duration,

    /// Prometheus textfile output; defaults to `<root>/health/obs_backup.prom`
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,

    /// Listen address of the daemon's status endpoint
    #[serde(default)]
    pub listen: Option<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            storage_warn_bytes: default_storage_warn_bytes(),
            storage_critical_bytes: None,
            log_window: default_log_window(),
            log_warn_threshold: default_log_warn_threshold(),
            export_sample: default_export_sample(),
            probe_timeout: default_probe_timeout(),
            metrics_file: None,
            listen: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestoreKind {
    /// Binary live state inside a volume or host path
    #[default]
    Live,
    /// Documents imported through the config service API
    ConfigImport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreTargetConfig {
    #[serde(default)]
    pub kind: RestoreKind,

    /// Archive top-level entry holding this target's data
    pub source: String,

    /// Owning service (key of `[services]`)
    #[serde(default)]
    pub service: Option<String>,

    #[serde(default)]
    pub volume: Option<String>,

    #[serde(default)]
    pub path: Option<PathBuf>,

    /// `uid:gid` applied to restored files
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Defaults to `<root>/safety`
    #[serde(default)]
    pub safety_dir: Option<PathBuf>,

    #[serde(default = "default_readiness_timeout", with = "duration_str")]
    pub readiness_timeout: Duration,

    #[serde(default = "default_poll_interval", with = "duration_str")]
    pub poll_interval: Duration,

    /// Restore targets keyed by scope name
    #[serde(default)]
    pub targets: BTreeMap<String, RestoreTargetConfig>,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            safety_dir: None,
            readiness_timeout: default_readiness_timeout(),
            poll_interval: default_poll_interval(),
            targets: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Container CLI binary
    #[serde(default = "default_runtime_binary")]
    pub binary: String,

    /// Image used for volume copy/clear helpers
    #[serde(default = "default_helper_image")]
    pub helper_image: String,

    #[serde(default = "default_runtime_timeout", with = "duration_str")]
    pub timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: default_runtime_binary(),
            helper_image: default_helper_image(),
            timeout: default_runtime_timeout(),
        }
    }
}

// Default values
fn default_true() -> bool {
    true
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_transfer_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/obs-backup")
}

fn default_snapshot_dir() -> String {
    "snapshots".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_storage_warn_bytes() -> u64 {
    50 * 1024 * 1024 * 1024 // 50 GiB
}

fn default_log_window() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_log_warn_threshold() -> usize {
    10
}

fn default_export_sample() -> usize {
    20
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_readiness_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_helper_image() -> String {
    "alpine:3.20".to_string()
}

fn default_runtime_timeout() -> Duration {
    Duration::from_secs(1800)
}

impl Config {
    /// Load configuration from a TOML file layered with environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-references that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let mut tier_names = HashSet::new();
        for tier in &self.tiers {
            if !tier_names.insert(tier.name.as_str()) {
                return Err(EngineError::Config(format!("duplicate tier `{}`", tier.name)));
            }
            let mut source_names = HashSet::new();
            for source in &tier.sources {
                if !source_names.insert(source.name.as_str()) {
                    return Err(EngineError::Config(format!(
                        "duplicate source `{}` in tier `{}`",
                        source.name, tier.name
                    )));
                }
            }
        }

        for (scope, target) in &self.restore.targets {
            if let Some(service) = &target.service {
                if !self.services.contains_key(service) {
                    return Err(EngineError::Config(format!(
                        "restore target `{}` references unknown service `{}`",
                        scope, service
                    )));
                }
            }
            match target.kind {
                RestoreKind::Live if target.volume.is_some() == target.path.is_some() => {
                    return Err(EngineError::Config(format!(
                        "restore target `{}` needs exactly one of `volume` or `path`",
                        scope
                    )));
                }
                RestoreKind::ConfigImport if self.config_api.is_none() => {
                    return Err(EngineError::Config(format!(
                        "restore target `{}` imports configuration but `[config_api]` is missing",
                        scope
                    )));
                }
                _ => {}
            }
        }

        // Surfaces source errors at load time rather than at the first run.
        self.backup_tiers().map(|_| ())
    }

    /// Convert the tier tables into the immutable tier model
    pub fn backup_tiers(&self) -> Result<Vec<BackupTier>> {
        self.tiers.iter().map(|t| self.build_tier(t)).collect()
    }

    pub fn tier(&self, name: &str) -> Result<BackupTier> {
        let tier = self
            .tiers
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| EngineError::UnknownTier(name.to_string()))?;
        self.build_tier(tier)
    }

    fn build_tier(&self, tier: &TierConfig) -> Result<BackupTier> {
        let sources = tier
            .sources
            .iter()
            .map(|s| self.build_source(&tier.name, s))
            .collect::<Result<Vec<_>>>()?;

        Ok(BackupTier {
            name: tier.name.clone(),
            schedule: tier.schedule.clone(),
            retention: tier.retention,
            compression: tier.compression,
            warn_after: tier.warn_after,
            critical_after: tier.critical_after.unwrap_or(tier.warn_after * 2),
            sources,
        })
    }

    fn build_source(&self, tier: &str, source: &SourceConfig) -> Result<SourceSpec> {
        let invalid = |reason: &str| {
            EngineError::Config(format!(
                "source `{}` in tier `{}`: {}",
                source.name, tier, reason
            ))
        };

        if source.name.is_empty() || source.name.contains('/') || source.name.starts_with('.') {
            return Err(invalid("name must be a plain directory name"));
        }

        let kind = match source.kind {
            SourceKindConfig::Path => SourceKind::Path {
                path: source.path.clone().ok_or_else(|| invalid("`path` is required"))?,
            },
            SourceKindConfig::Volume => SourceKind::Volume {
                volume: source
                    .volume
                    .clone()
                    .ok_or_else(|| invalid("`volume` is required"))?,
                subpath: source.subpath.clone(),
                quiesce: match &source.quiesce {
                    Some(service) => Some(self.container_of(service).ok_or_else(|| {
                        invalid(&format!("unknown quiesce service `{}`", service))
                    })?),
                    None => None,
                },
            },
            SourceKindConfig::Snapshot => {
                if self.snapshot.is_none() {
                    return Err(invalid("`[snapshot]` section is missing"));
                }
                SourceKind::Snapshot
            }
            SourceKindConfig::Export => {
                if self.config_api.is_none() {
                    return Err(invalid("`[config_api]` section is missing"));
                }
                let kinds = if source.exports.is_empty() {
                    ExportKind::ALL.to_vec()
                } else {
                    source.exports.clone()
                };
                SourceKind::Export { kinds }
            }
        };

        let pre_exec = match (&source.exec_in, source.exec.is_empty()) {
            (Some(service), false) => Some(PreExec {
                service: self
                    .container_of(service)
                    .ok_or_else(|| invalid(&format!("unknown exec service `{}`", service)))?,
                command: source.exec.clone(),
            }),
            (None, true) => None,
            _ => return Err(invalid("`exec_in` and `exec` must be set together")),
        };

        Ok(SourceSpec {
            name: source.name.clone(),
            mandatory: source.mandatory,
            kind,
            pre_exec,
            exclude: source.exclude.clone(),
        })
    }

    /// Container name of a logical service
    pub fn container_of(&self, service: &str) -> Option<String> {
        self.services.get(service).map(|s| s.container.clone())
    }

    pub fn safety_dir(&self) -> PathBuf {
        self.restore
            .safety_dir
            .clone()
            .unwrap_or_else(|| self.storage.root.join("safety"))
    }

    pub fn metrics_file(&self) -> PathBuf {
        self.health
            .metrics_file
            .clone()
            .unwrap_or_else(|| self.storage.root.join("health").join("obs_backup.prom"))
    }
}

/// Human-readable durations (`"90s"`, `"24h"`, `"7d"`) via humantime.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod opt_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => super::duration_str::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|r| humantime::parse_duration(&r).map_err(serde::de::Error::custom))
            .transpose()
    }
}

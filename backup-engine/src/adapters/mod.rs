//! Adapters for the external collaborators: the container runtime, the
//! dashboard service's configuration API and the secrets provider.

pub mod config_api;
pub mod runtime;
pub mod secrets;

pub use config_api::{export_items, ConfigApi, ExportSummary, HttpConfigApi, ItemRef};
pub use runtime::{DockerCli, ServiceRuntime};
pub use secrets::{DefaultSecrets, Secret, SecretsProvider};

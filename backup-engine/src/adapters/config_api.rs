//! Dashboard service configuration API (Grafana-compatible HTTP API).
//!
//! Used in both directions: exports read every item of each kind into
//! `<kind>/<id>.json` files, restores import those files back one by one.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use super::secrets::SecretsProvider;
use crate::config::ConfigApiConfig;
use crate::models::ExportKind;
use crate::utils::errors::{EngineError, Result};

/// Identity of one exportable item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: String,
    pub title: Option<String>,
}

#[async_trait]
pub trait ConfigApi: Send + Sync {
    async fn list(&self, kind: ExportKind) -> Result<Vec<ItemRef>>;

    async fn get(&self, kind: ExportKind, id: &str) -> Result<Value>;

    /// Create or overwrite one item from a previously exported document.
    async fn import(&self, kind: ExportKind, document: &Value) -> Result<()>;
}

pub struct HttpConfigApi {
    client: reqwest::Client,
    config: ConfigApiConfig,
    secrets: Arc<dyn SecretsProvider>,
}

impl HttpConfigApi {
    pub fn new(config: ConfigApiConfig, secrets: Arc<dyn SecretsProvider>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            secrets,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Attach credentials, resolved fresh for every request.
    async fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let builder = self.client.request(method, self.url(path));
        if let Some(token_ref) = &self.config.token_ref {
            let token = self.secrets.resolve(token_ref).await?;
            return Ok(builder.bearer_auth(token.expose()));
        }
        if let (Some(user), Some(password_ref)) = (&self.config.user, &self.config.password_ref) {
            let password = self.secrets.resolve(password_ref).await?;
            return Ok(builder.basic_auth(user, Some(password.expose())));
        }
        Ok(builder)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let response = self.request(Method::GET, path).await?.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Runtime(format!("GET {} returned {}", path, status)));
        }
        Ok(response.json().await?)
    }

    async fn send_json(&self, method: Method, path: &str, body: &Value) -> Result<StatusCode> {
        let response = self.request(method, path).await?.json(body).send().await?;
        Ok(response.status())
    }
}

#[async_trait]
impl ConfigApi for HttpConfigApi {
    async fn list(&self, kind: ExportKind) -> Result<Vec<ItemRef>> {
        let listing = self.get_json(list_path(kind)).await?;
        Ok(parse_listing(kind, &listing))
    }

    async fn get(&self, kind: ExportKind, id: &str) -> Result<Value> {
        self.get_json(&item_path(kind, id)).await
    }

    async fn import(&self, kind: ExportKind, document: &Value) -> Result<()> {
        let request = import_request(kind, document)?;
        let status = self.send_json(Method::POST, &request.path, &request.body).await?;
        if status.is_success() {
            return Ok(());
        }

        match (status, request.update) {
            (StatusCode::CONFLICT, Some((path, body))) => {
                debug!(kind = kind.dir_name(), %path, "Item exists, updating in place");
                let status = self.send_json(Method::PUT, &path, &body).await?;
                if status.is_success() {
                    Ok(())
                } else {
                    Err(EngineError::Runtime(format!("PUT {} returned {}", path, status)))
                }
            }
            _ => Err(EngineError::Runtime(format!(
                "POST {} returned {}",
                request.path, status
            ))),
        }
    }
}

fn list_path(kind: ExportKind) -> &'static str {
    match kind {
        ExportKind::Folders => "/api/folders",
        ExportKind::Datasources => "/api/datasources",
        ExportKind::Dashboards => "/api/search?type=dash-db",
        ExportKind::AlertRules => "/api/v1/provisioning/alert-rules",
    }
}

fn item_path(kind: ExportKind, id: &str) -> String {
    match kind {
        ExportKind::Folders => format!("/api/folders/{}", id),
        ExportKind::Datasources => format!("/api/datasources/uid/{}", id),
        ExportKind::Dashboards => format!("/api/dashboards/uid/{}", id),
        ExportKind::AlertRules => format!("/api/v1/provisioning/alert-rules/{}", id),
    }
}

/// Extract item identities from a list response. Every kind is listed as a
/// JSON array of objects carrying `uid` and a `title` (or `name`).
pub(crate) fn parse_listing(_kind: ExportKind, listing: &Value) -> Vec<ItemRef> {
    listing
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let id = item.get("uid")?.as_str()?.to_string();
                    let title = item
                        .get("title")
                        .or_else(|| item.get("name"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    Some(ItemRef { id, title })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// A create request plus the update to fall back to on `409 Conflict`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ImportRequest {
    pub path: String,
    pub body: Value,
    pub update: Option<(String, Value)>,
}

/// Build the write request for an exported document. Server-assigned
/// numeric ids are dropped so the target instance assigns its own.
pub(crate) fn import_request(kind: ExportKind, document: &Value) -> Result<ImportRequest> {
    let invalid = |reason: &str| {
        EngineError::Config(format!("{} document {}", kind.dir_name(), reason))
    };

    match kind {
        ExportKind::Dashboards => {
            let mut dashboard = document
                .get("dashboard")
                .cloned()
                .ok_or_else(|| invalid("has no `dashboard` field"))?;
            if let Some(obj) = dashboard.as_object_mut() {
                obj.insert("id".to_string(), Value::Null);
            }
            let folder_uid = document
                .pointer("/meta/folderUid")
                .and_then(Value::as_str)
                .filter(|uid| !uid.is_empty());
            let mut body = json!({ "dashboard": dashboard, "overwrite": true });
            if let Some(uid) = folder_uid {
                body["folderUid"] = json!(uid);
            }
            Ok(ImportRequest {
                path: "/api/dashboards/db".to_string(),
                body,
                update: None,
            })
        }
        ExportKind::Folders => {
            let uid = uid_of(document).ok_or_else(|| invalid("has no uid"))?;
            let title = document
                .get("title")
                .cloned()
                .ok_or_else(|| invalid("has no title"))?;
            Ok(ImportRequest {
                path: "/api/folders".to_string(),
                body: json!({ "uid": uid, "title": title }),
                update: Some((
                    format!("/api/folders/{}", uid),
                    json!({ "title": title, "overwrite": true }),
                )),
            })
        }
        ExportKind::Datasources | ExportKind::AlertRules => {
            let uid = uid_of(document).ok_or_else(|| invalid("has no uid"))?;
            let mut body = document.clone();
            if let Some(obj) = body.as_object_mut() {
                obj.remove("id");
            }
            let (create, update) = match kind {
                ExportKind::Datasources => (
                    "/api/datasources".to_string(),
                    format!("/api/datasources/uid/{}", uid),
                ),
                _ => (
                    "/api/v1/provisioning/alert-rules".to_string(),
                    format!("/api/v1/provisioning/alert-rules/{}", uid),
                ),
            };
            Ok(ImportRequest {
                path: create,
                body: body.clone(),
                update: Some((update, body)),
            })
        }
    }
}

fn uid_of(document: &Value) -> Option<String> {
    document.get("uid").and_then(Value::as_str).map(str::to_string)
}

/// Counts from one export pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub written: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Export every item of `kinds` into `dest/<kind>/<id>.json`. Individual
/// item failures are counted, not returned.
pub async fn export_items(api: &dyn ConfigApi, kinds: &[ExportKind], dest: &Path) -> Result<ExportSummary> {
    let mut summary = ExportSummary::default();

    for kind in kinds {
        let dir = dest.join(kind.dir_name());
        tokio::fs::create_dir_all(&dir).await?;

        let items = match api.list(*kind).await {
            Ok(items) => items,
            Err(e) => {
                warn!(kind = kind.dir_name(), error = %e, "Listing failed");
                summary.failed += 1;
                summary.errors.push(format!("list {}: {}", kind.dir_name(), e));
                continue;
            }
        };

        for item in items {
            let result = async {
                let document = api.get(*kind, &item.id).await?;
                let content = serde_json::to_vec_pretty(&document)?;
                tokio::fs::write(dir.join(format!("{}.json", file_stem(&item.id))), content).await?;
                Ok::<_, EngineError>(())
            }
            .await;

            match result {
                Ok(()) => summary.written += 1,
                Err(e) => {
                    summary.failed += 1;
                    summary.errors.push(format!("{} {}: {}", kind.dir_name(), item.id, e));
                }
            }
        }
    }

    Ok(summary)
}

/// File-system safe stem for an item id.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

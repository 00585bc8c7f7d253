//! Item-by-item import of exported configuration documents.

use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::adapters::ConfigApi;
use crate::models::ExportKind;
use crate::utils::errors::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub restored: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Exported documents under `root`, grouped by kind in import order.
pub fn collect_documents(root: &Path) -> Result<Vec<(ExportKind, Vec<PathBuf>)>> {
    let mut grouped = Vec::new();
    for kind in ExportKind::ALL {
        let dir = root.join(kind.dir_name());
        if !dir.is_dir() {
            continue;
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|x| x == "json"))
            .collect();
        files.sort();
        grouped.push((kind, files));
    }
    Ok(grouped)
}

/// Import every document under `root`. A document that cannot be read or
/// is rejected counts as failed; the import carries on.
pub async fn import_tree(api: &dyn ConfigApi, root: &Path) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();

    for (kind, files) in collect_documents(root)? {
        for file in files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            let document = match tokio::fs::read(&file).await {
                Ok(bytes) => serde_json::from_slice::<Value>(&bytes).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            let result = match document {
                Ok(document) => api.import(kind, &document).await.map_err(|e| e.to_string()),
                Err(reason) => Err(reason),
            };

            match result {
                Ok(()) => {
                    debug!(kind = kind.dir_name(), item = %name, "Imported");
                    summary.restored += 1;
                }
                Err(reason) => {
                    warn!(kind = kind.dir_name(), item = %name, %reason, "Import failed");
                    summary.failed += 1;
                    summary.errors.push(format!("{}/{}: {}", kind.dir_name(), name, reason));
                }
            }
        }
    }

    Ok(summary)
}

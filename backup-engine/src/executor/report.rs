//! Run report - the human and machine summary of one backup run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write;
use std::path::PathBuf;

use crate::models::Archive;
use crate::replication::ReplicationResult;
use crate::retention::PruneReport;
use crate::scheduler::RunStatus;
use crate::utils::format::{format_bytes, format_duration_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Included,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub name: String,
    pub kind: String,
    pub mandatory: bool,
    pub status: SourceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub digest: String,
}

impl From<&Archive> for ArchiveSummary {
    fn from(archive: &Archive) -> Self {
        Self {
            path: archive.path.clone(),
            file_name: archive.file_name.clone(),
            size_bytes: archive.size_bytes,
            digest: archive.digest.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub tier: String,
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub archive: Option<ArchiveSummary>,
    pub sources: Vec<SourceReport>,
    pub replication: Vec<ReplicationResult>,
    pub retention: Option<PruneReport>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub log_path: Option<PathBuf>,
}

impl RunReport {
    pub fn new(tier: &str, run_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            tier: tier.to_string(),
            run_id: run_id.to_string(),
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            duration_ms: 0,
            archive: None,
            sources: Vec::new(),
            replication: Vec::new(),
            retention: None,
            warnings: Vec::new(),
            errors: Vec::new(),
            log_path: None,
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Close the report. Any recorded error makes the run `Failed`;
    /// warnings never do.
    pub fn finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.status = if self.errors.is_empty() && self.archive.is_some() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
    }

    /// Shorthand for a run that could not start at all.
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.error(reason);
        self.finish();
        self
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    fn count(&self, status: SourceStatus) -> usize {
        self.sources.iter().filter(|s| s.status == status).count()
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let short_run: String = self.run_id.chars().take(8).collect();
        let _ = writeln!(
            out,
            "Tier {} run {}: {} in {}",
            self.tier,
            short_run,
            self.status.as_str(),
            format_duration_ms(self.duration_ms)
        );

        if let Some(archive) = &self.archive {
            let _ = writeln!(
                out,
                "  archive      {} ({}, sha256 {})",
                archive.file_name,
                format_bytes(archive.size_bytes),
                &archive.digest[..archive.digest.len().min(12)]
            );
        }

        let _ = writeln!(
            out,
            "  sources      {} included, {} skipped, {} failed",
            self.count(SourceStatus::Included),
            self.count(SourceStatus::Skipped),
            self.count(SourceStatus::Failed)
        );
        for source in self.sources.iter().filter(|s| s.status != SourceStatus::Included) {
            let _ = writeln!(
                out,
                "    - {}: {:?} ({})",
                source.name,
                source.status,
                source.detail.as_deref().unwrap_or("no detail")
            );
        }

        for result in &self.replication {
            let line = match result {
                ReplicationResult::Replicated { target, location, .. } => format!("{}: copied to {}", target, location),
                ReplicationResult::Skipped { target, reason } => format!("{}: skipped ({})", target, reason),
                ReplicationResult::Failed { target, reason } => format!("{}: FAILED ({})", target, reason),
            };
            let _ = writeln!(out, "  replication  {}", line);
        }

        if let Some(retention) = &self.retention {
            let _ = writeln!(
                out,
                "  retention    {} removed, {} kept",
                retention.removed.len(),
                retention.kept.len()
            );
        }

        for warning in &self.warnings {
            let _ = writeln!(out, "  warning      {}", warning);
        }
        for error in &self.errors {
            let _ = writeln!(out, "  error        {}", error);
        }
        if let Some(log) = &self.log_path {
            let _ = writeln!(out, "  log          {}", log.display());
        }
        out
    }
}

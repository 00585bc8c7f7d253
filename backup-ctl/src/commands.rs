//! One function per operator command. Each prints its result in the chosen
//! format and returns the process exit code.

use backup_engine::archive::verify_archive;
use backup_engine::layout::ArtifactLayout;
use backup_engine::models::Archive;
use backup_engine::restore::TargetStatus;
use backup_engine::retention;
use backup_engine::utils::format::{format_age, format_bytes};
use backup_engine::{
    ArchiveRef, EngineContext, EngineError, HealthMonitor, RestoreCoordinator, RestorePlan, TriggerResult,
};
use backup_engine::{BackupExecutor, Confirmer};
use chrono::Utc;
use clap::ValueEnum;
use serde::Serialize;
use serde_json::json;
use std::fmt::Write;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::exit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce() -> String) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => print!("{}", text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

/// Asks on the terminal; anything but `y`/`yes` declines.
pub struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&self, prompt: &str) -> bool {
        eprint!("{} [y/N] ", prompt);
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

pub async fn backup(ctx: Arc<EngineContext>, tier: &str, format: OutputFormat) -> anyhow::Result<i32> {
    match BackupExecutor::new(ctx).trigger(tier).await? {
        TriggerResult::Completed(report) => {
            emit(format, &report, || report.render_text())?;
            Ok(if !report.succeeded() {
                exit::CRITICAL
            } else if report.warnings.is_empty() {
                exit::OK
            } else {
                exit::WARNING
            })
        }
        TriggerResult::Coalesced { tier, running_run } => {
            let value = json!({ "tier": tier, "coalesced_into": running_run });
            emit(format, &value, || format!("Tier {} is already running (run {}); trigger dropped\n", tier, running_run))?;
            Ok(exit::WARNING)
        }
    }
}

pub async fn health(ctx: Arc<EngineContext>, format: OutputFormat) -> anyhow::Result<i32> {
    let report = HealthMonitor::new(ctx).run().await?;
    emit(format, &report, || report.render_text())?;
    Ok(report.exit_code())
}

pub struct RestoreArgs {
    pub scopes: Vec<String>,
    pub archive: Option<PathBuf>,
    pub tier: Option<String>,
    pub dry_run: bool,
    pub force: bool,
}

pub async fn restore(ctx: Arc<EngineContext>, args: RestoreArgs, format: OutputFormat) -> anyhow::Result<i32> {
    let archive = match (args.archive, args.tier) {
        (Some(path), _) => ArchiveRef::Path(path),
        (None, Some(tier)) => ArchiveRef::Latest { tier },
        (None, None) => return Err(EngineError::Config("restore needs --archive or --tier".into()).into()),
    };
    let plan = RestorePlan {
        archive,
        scopes: args.scopes,
        force: args.force,
        dry_run: args.dry_run,
    };

    let report = RestoreCoordinator::new(ctx).restore(&plan, &StdinConfirmer).await?;
    emit(format, &report, || report.render_text())?;

    let degraded = report.targets.iter().any(|t| t.status == TargetStatus::Degraded);
    Ok(if !report.succeeded() {
        exit::CRITICAL
    } else if degraded || !report.warnings.is_empty() {
        exit::WARNING
    } else {
        exit::OK
    })
}

#[derive(Serialize)]
struct TierListing {
    tier: String,
    latest: Option<String>,
    archives: Vec<Archive>,
}

pub fn list(ctx: &EngineContext, tier: Option<&str>, format: OutputFormat) -> anyhow::Result<i32> {
    let tiers = match tier {
        Some(name) => vec![ctx.config.tier(name)?],
        None => ctx.config.backup_tiers()?,
    };

    let mut listings = Vec::with_capacity(tiers.len());
    for tier in &tiers {
        let latest = ctx
            .layout
            .read_latest(&tier.name)
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()));
        listings.push(TierListing {
            tier: tier.name.clone(),
            latest,
            archives: ctx.layout.list_archives(&tier.name)?,
        });
    }

    emit(format, &listings, || {
        let now = Utc::now();
        let mut out = String::new();
        for listing in &listings {
            let _ = writeln!(out, "{} ({} archives)", listing.tier, listing.archives.len());
            for archive in listing.archives.iter().rev() {
                let marker = if listing.latest.as_deref() == Some(archive.file_name.as_str()) { "*" } else { " " };
                let _ = writeln!(
                    out,
                    " {} {:<48} {:>10} {:>8}  {}",
                    marker,
                    archive.file_name,
                    format_bytes(archive.size_bytes),
                    format_age(archive.age(now)),
                    archive.short_digest()
                );
            }
        }
        out
    })?;
    Ok(exit::OK)
}

pub async fn verify(path: PathBuf, format: OutputFormat) -> anyhow::Result<i32> {
    let checked = path.clone();
    let result = tokio::task::spawn_blocking(move || {
        let expected = ArtifactLayout::load_sidecar(&checked).map(|a| a.digest);
        verify_archive(&checked, expected.as_deref(), None)
    })
    .await?;

    match result {
        Ok(report) => {
            emit(format, &json!({ "archive": path, "valid": true, "report": report }), || {
                format!(
                    "{}: ok ({} entries, sha256 {})\n",
                    path.display(),
                    report.entries,
                    report.digest
                )
            })?;
            Ok(exit::OK)
        }
        Err(e) => {
            emit(format, &json!({ "archive": path, "valid": false, "error": e.to_string() }), || {
                format!("{}: FAILED: {}\n", path.display(), e)
            })?;
            Ok(exit::CRITICAL)
        }
    }
}

pub async fn prune(ctx: &EngineContext, tier: Option<&str>, format: OutputFormat) -> anyhow::Result<i32> {
    let tiers = match tier {
        Some(name) => vec![ctx.config.tier(name)?],
        None => ctx.config.backup_tiers()?,
    };

    let mut reports = Vec::with_capacity(tiers.len());
    for tier in &tiers {
        reports.push(retention::prune(&ctx.layout, tier).await?);
    }

    emit(format, &reports, || {
        let mut out = String::new();
        for report in &reports {
            let _ = writeln!(
                out,
                "{}: removed {} archives, kept {}; {} exports and {} logs removed",
                report.tier,
                report.removed.len(),
                report.kept.len(),
                report.exports_removed,
                report.logs_removed
            );
            for name in &report.removed {
                let _ = writeln!(out, "  - {}", name);
            }
        }
        out
    })?;
    Ok(exit::OK)
}

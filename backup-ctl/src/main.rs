mod commands;
mod config;
mod error;
mod routes;
mod services;
mod state;

use crate::commands::{OutputFormat, RestoreArgs};
use crate::error::{exit, exit_code_for};
use crate::services::health_loop::start_health_loop;
use crate::services::tier_scheduler::TierCron;
use crate::state::AppState;
use backup_engine::utils::logger;
use backup_engine::EngineContext;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How long the daemon waits for in-flight runs after SIGINT/SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15 * 60);

#[derive(Parser, Debug)]
#[command(name = "obs-backup", version, about = "Tiered backups, health checks and restores for the observability stack")]
struct Cli {
    /// Config file (defaults to $OBS_BACKUP_CONFIG, then /etc/obs-backup/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Overrides `[log] level`; RUST_LOG still wins
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run tier schedules and the health monitor until SIGINT/SIGTERM
    Daemon,
    /// Trigger one tier now
    Backup { tier: String },
    /// Run every health check, publish metrics and clean up old artifacts
    Health,
    /// Restore live state from an archive
    Restore {
        /// Restore target to include (repeatable); all covered targets when omitted
        #[arg(long = "scope")]
        scopes: Vec<String>,
        /// Archive file, e.g. a safety copy
        #[arg(long, conflicts_with = "tier")]
        archive: Option<PathBuf>,
        /// Use this tier's latest archive
        #[arg(long, required_unless_present = "archive")]
        tier: Option<String>,
        /// Verify and extract only; touch nothing live
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// List archives per tier
    List {
        #[arg(long)]
        tier: Option<String>,
    },
    /// Check an archive's structure and digest
    Verify { archive: PathBuf },
    /// Apply retention now
    Prune {
        #[arg(long)]
        tier: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { exit::USAGE } else { exit::OK };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = config::load(cli.config.as_deref())?;
    logger::init_from_config(&config.log, cli.log_level.as_deref())?;

    // `verify` needs no adapters, but a readable config keeps usage uniform.
    if let Command::Verify { archive } = cli.command {
        return commands::verify(archive, cli.format).await;
    }

    let ctx = Arc::new(EngineContext::from_config(config)?);
    let format = cli.format;

    match cli.command {
        Command::Daemon => daemon(ctx).await.map(|_| exit::OK),
        Command::Backup { tier } => commands::backup(ctx, &tier, format).await,
        Command::Health => commands::health(ctx, format).await,
        Command::Restore {
            scopes,
            archive,
            tier,
            dry_run,
            force,
        } => {
            let args = RestoreArgs {
                scopes,
                archive,
                tier,
                dry_run,
                force,
            };
            commands::restore(ctx, args, format).await
        }
        Command::List { tier } => commands::list(&ctx, tier.as_deref(), format),
        Command::Prune { tier } => commands::prune(&ctx, tier.as_deref(), format).await,
        Command::Verify { .. } => Ok(exit::OK),
    }
}

async fn daemon(ctx: Arc<EngineContext>) -> anyhow::Result<()> {
    tracing::info!(
        root = %ctx.layout.root().display(),
        tiers = ctx.config.tiers.len(),
        "Starting backup daemon"
    );
    std::fs::create_dir_all(ctx.layout.root())?;

    let state = Arc::new(AppState::new(ctx.clone()));

    // Start health monitor
    let cancel = CancellationToken::new();
    start_health_loop(state.clone(), cancel.clone());

    // Initialize cron scheduler
    let scheduler = match TierCron::new(state.clone()).await {
        Ok(s) => {
            if let Err(e) = s.init_schedules().await {
                tracing::warn!("Failed to initialize schedules: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    match ctx.config.health.listen.clone() {
        Some(addr) => {
            let app = routes::create_router(state.clone());
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!("Status endpoint listening on {}", addr);
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal(cancel.clone()))
                .await?;
        }
        None => shutdown_signal(cancel.clone()).await,
    }

    // Cleanup
    tracing::info!("Shutting down...");
    cancel.cancel();

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    // Post-hooks of a run cut short here would leave services quiesced.
    if !state.drain(SHUTDOWN_GRACE).await {
        tracing::error!("Exiting with backup work still in flight");
    }

    tracing::info!("Daemon stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_requires_archive_or_tier() {
        assert!(Cli::try_parse_from(["obs-backup", "restore", "--scope", "datastore"]).is_err());
        assert!(Cli::try_parse_from(["obs-backup", "restore", "--tier", "critical", "--archive", "/a.tar.zst"]).is_err());

        let cli = Cli::try_parse_from([
            "obs-backup", "--format", "json", "restore", "--tier", "critical", "--scope", "datastore", "--scope",
            "config", "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        let Command::Restore { scopes, dry_run, force, .. } = cli.command else {
            panic!("expected restore");
        };
        assert_eq!(scopes, vec!["datastore".to_string(), "config".to_string()]);
        assert!(dry_run);
        assert!(!force);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["obs-backup", "health", "--format", "json", "-c", "/tmp/c.toml"]).unwrap();
        assert!(matches!(cli.command, Command::Health));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }
}

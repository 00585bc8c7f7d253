//! Logging configuration using tracing, plus the append-only per-run log.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogConfig, LogOutput};

/// Initialize logging with the specified level. Diagnostics go to stderr;
/// stdout carries command output.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}

/// Initialize logging from the `[log]` section. File output appends to
/// `<dir>/obs-backup.log` without ANSI colouring.
pub fn init_from_config(config: &LogConfig, level_override: Option<&str>) -> anyhow::Result<()> {
    let level = level_override.unwrap_or(&config.level);
    match config.output {
        LogOutput::Stdout => init(level),
        LogOutput::File => {
            std::fs::create_dir_all(&config.dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(config.dir.join("obs-backup.log"))?;

            let filter = EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(level))
                .unwrap_or_else(|_| EnvFilter::new("info"));

            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()?;
            Ok(())
        }
    }
}

/// Severity token written into per-run log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLogLevel {
    Info,
    Warn,
    Error,
}

impl RunLogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunLogLevel::Info => "INFO",
            RunLogLevel::Warn => "WARN",
            RunLogLevel::Error => "ERROR",
        }
    }
}

/// Append-only log for a single backup or restore run.
///
/// Lines look like `2026-10-19T02:00:00Z WARN source=prometheus snapshot skipped`.
/// Write failures are swallowed after a tracing warning: losing a run log
/// line must never fail the run itself.
pub struct RunLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl RunLog {
    pub fn open(path: &Path) -> Self {
        let file = path
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .and_then(|_| OpenOptions::new().create(true).append(true).open(path).map(Some));

        let file = match file {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Cannot open run log");
                None
            }
        };

        Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.write(RunLogLevel::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.write(RunLogLevel::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.write(RunLogLevel::Error, message.as_ref());
    }

    fn write(&self, level: RunLogLevel, message: &str) {
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        if let Some(file) = guard.as_mut() {
            let line = format!(
                "{} {} {}\n",
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                level.as_str(),
                message
            );
            if let Err(e) = file.write_all(line.as_bytes()) {
                tracing::warn!(path = %self.path.display(), error = %e, "Run log write failed");
            }
        }
    }
}

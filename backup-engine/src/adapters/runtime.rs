//! Container runtime operations: service start/stop, exec, and volume I/O.
//!
//! Volume I/O goes through a short-lived helper container that mounts the
//! named volume next to a host directory, so the engine never needs to know
//! where the runtime keeps volume data on disk.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::utils::errors::{EngineError, Result};

#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    async fn stop(&self, container: &str) -> Result<()>;

    async fn start(&self, container: &str) -> Result<()>;

    async fn is_running(&self, container: &str) -> Result<bool>;

    /// Run a command inside a running container and return its stdout.
    async fn exec(&self, container: &str, command: &[String]) -> Result<String>;

    /// Copy a volume's contents (or one subdirectory of it) into `dest`.
    async fn copy_from_volume(&self, volume: &str, subpath: Option<&str>, dest: &Path) -> Result<()>;

    /// Copy the contents of host directory `src` into the root of a volume.
    async fn copy_into_volume(&self, src: &Path, volume: &str) -> Result<()>;

    /// Delete everything inside a volume, keeping the volume itself.
    async fn clear_volume(&self, volume: &str) -> Result<()>;

    async fn remove_from_volume(&self, volume: &str, subpath: &str) -> Result<()>;

    /// Recursively chown a volume's contents to `uid:gid`.
    async fn chown_volume(&self, volume: &str, owner: &str) -> Result<()>;
}

/// `ServiceRuntime` over the docker-compatible CLI.
pub struct DockerCli {
    binary: String,
    helper_image: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            helper_image: config.helper_image.clone(),
            timeout: config.timeout,
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        debug!(binary = %self.binary, ?args, "Running container command");

        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.binary)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            EngineError::Runtime(format!(
                "`{} {}` timed out after {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or(""),
                humantime::format_duration(self.timeout)
            ))
        })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Runtime(format!(
                "`{} {}` failed ({}): {}",
                self.binary,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// `run --rm` of the helper image with the given mounts and shell script.
    async fn helper(&self, mounts: &[String], script: &str) -> Result<()> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        for mount in mounts {
            args.push("-v".to_string());
            args.push(mount.clone());
        }
        args.push(self.helper_image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(script.to_string());
        self.run(&args).await.map(|_| ())
    }
}

#[async_trait]
impl ServiceRuntime for DockerCli {
    async fn stop(&self, container: &str) -> Result<()> {
        self.run(&["stop".to_string(), container.to_string()]).await.map(|_| ())
    }

    async fn start(&self, container: &str) -> Result<()> {
        self.run(&["start".to_string(), container.to_string()]).await.map(|_| ())
    }

    async fn is_running(&self, container: &str) -> Result<bool> {
        let out = self
            .run(&[
                "inspect".to_string(),
                "-f".to_string(),
                "{{.State.Running}}".to_string(),
                container.to_string(),
            ])
            .await?;
        Ok(out.trim() == "true")
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<String> {
        let mut args = vec!["exec".to_string(), container.to_string()];
        args.extend(command.iter().cloned());
        self.run(&args).await
    }

    async fn copy_from_volume(&self, volume: &str, subpath: Option<&str>, dest: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest).await?;
        let from = match subpath {
            Some(sub) => format!("/from/{}", checked_subpath(sub)?),
            None => "/from".to_string(),
        };
        self.helper(
            &[
                format!("{}:/from:ro", volume),
                format!("{}:/to", host_path(dest)?),
            ],
            &format!("cp -a {}/. /to/", shell_quote(&from)),
        )
        .await
    }

    async fn copy_into_volume(&self, src: &Path, volume: &str) -> Result<()> {
        self.helper(
            &[
                format!("{}:/from:ro", host_path(src)?),
                format!("{}:/to", volume),
            ],
            "cp -a /from/. /to/",
        )
        .await
    }

    async fn clear_volume(&self, volume: &str) -> Result<()> {
        self.helper(&[format!("{}:/to", volume)], "find /to -mindepth 1 -delete")
            .await
    }

    async fn remove_from_volume(&self, volume: &str, subpath: &str) -> Result<()> {
        let target = format!("/to/{}", checked_subpath(subpath)?);
        self.helper(
            &[format!("{}:/to", volume)],
            &format!("rm -rf {}", shell_quote(&target)),
        )
        .await
    }

    async fn chown_volume(&self, volume: &str, owner: &str) -> Result<()> {
        if !owner.chars().all(|c| c.is_ascii_digit() || c == ':') {
            return Err(EngineError::Runtime(format!("invalid owner `{}`", owner)));
        }
        self.helper(&[format!("{}:/to", volume)], &format!("chown -R {} /to", owner))
            .await
    }
}

/// Reject absolute paths and `..` so a helper never escapes its mount.
fn checked_subpath(subpath: &str) -> Result<&str> {
    let trimmed = subpath.trim_matches('/');
    if trimmed.is_empty() || trimmed.split('/').any(|part| part == "..") {
        return Err(EngineError::Runtime(format!("invalid volume subpath `{}`", subpath)));
    }
    Ok(trimmed)
}

/// Bind mounts need absolute host paths.
fn host_path(path: &Path) -> Result<String> {
    let absolute = std::fs::canonicalize(path)?;
    Ok(absolute.to_string_lossy().to_string())
}

/// Single-quote a string for `sh -c`.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

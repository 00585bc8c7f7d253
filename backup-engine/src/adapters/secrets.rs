//! Credential resolution.
//!
//! References are resolved at call time and never cached or written out:
//!
//! * `env:NAME` - an environment variable
//! * `file:/run/secrets/name` - a mounted secret file (read only)
//! * `cmd:item` - the configured `[secrets] command` with `item` appended,
//!   e.g. `["pass", "show"]` + `grafana/admin`

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::utils::errors::{EngineError, Result};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A plaintext credential. Formatting never reveals the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<Secret>;
}

/// Resolves `env:`, `file:` and `cmd:` references.
pub struct DefaultSecrets {
    command: Vec<String>,
}

impl DefaultSecrets {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    async fn run_command(&self, reference: &str, item: &str) -> Result<Secret> {
        let fail = |reason: String| EngineError::Secret {
            reference: reference.to_string(),
            reason,
        };

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| fail("no [secrets] command configured".to_string()))?;

        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            tokio::process::Command::new(program)
                .args(args)
                .arg(item)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| fail("secrets command timed out".to_string()))?
        .map_err(|e| fail(e.to_string()))?;

        if !output.status.success() {
            return Err(fail(format!("secrets command exited with {}", output.status)));
        }

        // First line only: password managers print extra fields below it.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let value = stdout.lines().next().unwrap_or("").to_string();
        if value.is_empty() {
            return Err(fail("secrets command printed nothing".to_string()));
        }
        Ok(Secret(value))
    }
}

#[async_trait]
impl SecretsProvider for DefaultSecrets {
    async fn resolve(&self, reference: &str) -> Result<Secret> {
        let fail = |reason: &str| EngineError::Secret {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        match reference.split_once(':') {
            Some(("env", name)) => std::env::var(name)
                .map(Secret)
                .map_err(|_| fail("environment variable is not set")),
            Some(("file", path)) => {
                let content = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| fail(&e.to_string()))?;
                Ok(Secret(content.trim_end_matches(['\n', '\r']).to_string()))
            }
            Some(("cmd", item)) => self.run_command(reference, item).await,
            _ => Err(fail("expected env:, file: or cmd: prefix")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret([REDACTED])");
        assert_eq!(format!("{}", secret), "[REDACTED]");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[tokio::test]
    async fn test_resolve_env_and_file() {
        std::env::set_var("OBS_BACKUP_TEST_SECRET", "s3cret");
        let secrets = DefaultSecrets::new(Vec::new());
        let value = secrets.resolve("env:OBS_BACKUP_TEST_SECRET").await.unwrap();
        assert_eq!(value.expose(), "s3cret");

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "abc\n").unwrap();
        let value = secrets
            .resolve(&format!("file:{}", path.display()))
            .await
            .unwrap();
        assert_eq!(value.expose(), "abc");
    }

    #[tokio::test]
    async fn test_resolve_command() {
        let secrets = DefaultSecrets::new(vec!["echo".to_string()]);
        let value = secrets.resolve("cmd:from-command").await.unwrap();
        assert_eq!(value.expose(), "from-command");
    }

    #[tokio::test]
    async fn test_bad_references() {
        let secrets = DefaultSecrets::new(Vec::new());
        assert!(matches!(
            secrets.resolve("plaintext").await,
            Err(EngineError::Secret { .. })
        ));
        assert!(secrets.resolve("env:OBS_BACKUP_DEFINITELY_UNSET").await.is_err());
        assert!(secrets.resolve("cmd:item").await.is_err());
    }
}

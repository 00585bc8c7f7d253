//! The live-state lock.
//!
//! Anything that stops, starts or overwrites a running service (backup
//! quiesce hooks, the restore coordinator) holds this lock. It is an
//! advisory `flock` on `<root>/.live-state.lock`, so it also excludes other
//! processes such as a manual `restore` running beside the daemon.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::utils::errors::{EngineError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct LiveStateLock {
    path: PathBuf,
    timeout: Duration,
}

/// Held lock. Released when dropped.
pub struct LiveStateGuard {
    _lock: Flock<File>,
    holder: String,
}

impl LiveStateGuard {
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for LiveStateGuard {
    fn drop(&mut self) {
        debug!(holder = %self.holder, "Live-state lock released");
    }
}

impl LiveStateLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    /// Take the lock without waiting. `None` when another holder has it.
    pub fn try_acquire(&self, holder: &str) -> Result<Option<LiveStateGuard>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                // Record the holder for operators inspecting a stuck lock.
                lock.set_len(0)?;
                (&*lock).write_all(format!("{} pid={}\n", holder, std::process::id()).as_bytes())?;
                Ok(Some(LiveStateGuard {
                    _lock: lock,
                    holder: holder.to_string(),
                }))
            }
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(EngineError::Lock(format!("{}: {}", self.path.display(), errno))),
        }
    }

    /// Wait up to the configured timeout for the lock.
    pub async fn acquire(&self, holder: &str) -> Result<LiveStateGuard> {
        let started = Instant::now();
        let mut announced = false;

        loop {
            if let Some(guard) = self.try_acquire(holder)? {
                debug!(holder, "Live-state lock acquired");
                return Ok(guard);
            }
            if started.elapsed() >= self.timeout {
                return Err(EngineError::Lock(format!(
                    "held by `{}` for longer than {}",
                    self.current_holder().unwrap_or_else(|| "unknown".to_string()),
                    humantime::format_duration(self.timeout)
                )));
            }
            if !announced {
                info!(holder, current = ?self.current_holder(), "Waiting for live-state lock");
                announced = true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Holder line written by the current owner, if any.
    pub fn current_holder(&self) -> Option<String> {
        std::fs::read_to_string(&self.path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

//! Ownership and permission handling for restored files.
//!
//! Services inside the stack run as fixed users (the dashboard service as
//! uid 472, the time-series database as `nobody`), so restored trees must be
//! handed back to them before the service starts.

use nix::unistd::{chown, Gid, Uid};
use std::path::Path;
use walkdir::WalkDir;

use crate::utils::errors::{EngineError, Result};

/// A `uid:gid` pair applied recursively to restored files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    /// Parse `"uid:gid"` or a bare `"uid"` (gid defaults to the uid).
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || EngineError::Config(format!("invalid owner `{}`, expected uid:gid", spec));
        let (uid, gid) = match spec.split_once(':') {
            Some((u, g)) => (u, g),
            None => (spec, spec),
        };
        Ok(Self {
            uid: uid.trim().parse().map_err(|_| invalid())?,
            gid: gid.trim().parse().map_err(|_| invalid())?,
        })
    }

    pub fn as_spec(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }

    /// Apply this ownership to `root` and everything below it. Symlinks are
    /// changed themselves, never their targets.
    pub fn apply_recursive(&self, root: &Path) -> Result<()> {
        let uid = Some(Uid::from_raw(self.uid));
        let gid = Some(Gid::from_raw(self.gid));

        for entry in WalkDir::new(root) {
            let entry = entry.map_err(|e| EngineError::Io(e.into()))?;
            if entry.path_is_symlink() {
                std::os::unix::fs::lchown(entry.path(), Some(self.uid), Some(self.gid))?;
            } else {
                chown(entry.path(), uid, gid).map_err(|e| EngineError::Io(e.into()))?;
            }
        }
        Ok(())
    }
}

/// Permission bits of a path, used to preserve modes when copying.
pub fn mode_of(path: &Path) -> std::io::Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(std::fs::symlink_metadata(path)?.permissions().mode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[test]
    fn test_parse_owner_specs() {
        assert_eq!(Ownership::parse("472:0").unwrap(), Ownership { uid: 472, gid: 0 });
        assert_eq!(Ownership::parse("65534").unwrap(), Ownership { uid: 65534, gid: 65534 });
        assert!(Ownership::parse("grafana").is_err());
        assert_eq!(Ownership { uid: 1, gid: 2 }.as_spec(), "1:2");
    }

    #[test]
    fn test_apply_current_owner_is_noop() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        std::fs::create_dir(dir.path().join("data"))?;
        std::fs::write(dir.path().join("data/file"), b"x")?;

        let meta = std::fs::metadata(dir.path())?;
        let owner = Ownership { uid: meta.uid(), gid: meta.gid() };
        owner.apply_recursive(dir.path()).unwrap();

        let after = std::fs::metadata(dir.path().join("data/file"))?;
        assert_eq!(after.uid(), meta.uid());
        Ok(())
    }

    #[test]
    fn test_mode_of() -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new()?;
        let file = dir.path().join("f");
        std::fs::write(&file, b"x")?;
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o640))?;
        assert_eq!(mode_of(&file)? & 0o777, 0o640);
        Ok(())
    }
}

use backup_engine::Config;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "/etc/obs-backup/config.toml";

/// Resolve the config file: `--config`, then `OBS_BACKUP_CONFIG`, then the
/// system default. `.env` in the working directory is read first.
pub fn resolve_path(flag: Option<&Path>) -> PathBuf {
    let _ = dotenvy::dotenv();

    flag.map(Path::to_path_buf)
        .or_else(|| std::env::var("OBS_BACKUP_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn load(flag: Option<&Path>) -> anyhow::Result<Config> {
    let path = resolve_path(flag);
    let config = Config::load(&path)?;
    tracing::debug!(path = %path.display(), tiers = config.tiers.len(), "Configuration loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_wins_over_default() {
        let path = resolve_path(Some(Path::new("/tmp/custom.toml")));
        assert_eq!(path, PathBuf::from("/tmp/custom.toml"));
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Live tree to back up
    pub source_dir: PathBuf,

    /// Backup destination path (must exist and be empty)
    pub backup_dest: PathBuf,

    /// Longest a handler waits for a name held by another operation
    pub wait_timeout: String,

    /// Copier throughput limit in bytes per second (0 = unlimited)
    pub copy_bytes_per_sec: u64,

    /// Recent operations kept for the session report
    pub journal_entries: usize,

    /// Compare source and destination after the driver's backup
    pub verify: bool,

    /// Emit logs as JSON
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/home")),
            backup_dest: PathBuf::from("/var/backups/hotbackup"),
            wait_timeout: "30s".to_string(),
            copy_bytes_per_sec: 0,
            journal_entries: 1000,
            verify: true,
            log_json: false,
        }
    }
}

impl Config {
    /// Config rooted at the given trees, everything else defaulted.
    pub fn with_roots(source_dir: impl Into<PathBuf>, backup_dest: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            backup_dest: backup_dest.into(),
            ..Self::default()
        }
    }

    /// Load config from an optional file layered under `HOTBACKUP_*` variables
    pub fn load() -> Result<Self> {
        let file = std::env::var_os("HOTBACKUP_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::config_dir().map(|d| d.join("hotbackup").join("hotbackup.toml")));

        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("HOTBACKUP").try_parsing(true))
            .build()
            .context("failed to read configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("failed to parse configuration")?;
        config.wait_timeout()?;
        Ok(config)
    }

    pub fn wait_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.wait_timeout)
            .with_context(|| format!("invalid wait_timeout {:?}", self.wait_timeout))
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_wait_timeout_parses() {
        let config = Config::default();
        assert_eq!(config.wait_timeout().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_bad_wait_timeout_is_rejected() {
        let config = Config {
            wait_timeout: "soon".into(),
            ..Config::default()
        };
        assert!(config.wait_timeout().is_err());
    }

    #[test]
    fn test_with_roots_keeps_defaults() {
        let config = Config::with_roots("/a", "/b");
        assert_eq!(config.source_dir, PathBuf::from("/a"));
        assert_eq!(config.backup_dest, PathBuf::from("/b"));
        assert_eq!(config.journal_entries, 1000);
        assert!(config.verify);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hotbackup.toml");
        std::fs::write(&path, "source_dir = \"/data\"\ncopy_bytes_per_sec = 4096\n").unwrap();

        let config: Config = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.source_dir, PathBuf::from("/data"));
        assert_eq!(config.copy_bytes_per_sec, 4096);
        assert_eq!(config.wait_timeout, "30s");
    }
}

//! Push configuration stored at `<dest>/dpush.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name inside a destination directory
pub const CONFIG_FILE: &str = "dpush.json";

/// Settings of a push destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Mapping table database, relative to the destination.
    pub mapping_db: PathBuf,
    /// Object database directory, relative to the destination.
    pub object_dir: PathBuf,
    /// Ref updated when none is named on the command line.
    pub default_ref: String,
    /// Peer URL used by `push-remote` when none is given.
    pub remote_url: Option<String>,
    /// HTTP timeout in seconds.
    pub http_timeout_secs: u64,
    /// zstd level for pack streams.
    pub compression_level: i32,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            mapping_db: PathBuf::from("mapping.sqlite"),
            object_dir: PathBuf::from("store"),
            default_ref: "refs/heads/master".to_string(),
            remote_url: None,
            http_timeout_secs: 300,
            compression_level: 3,
        }
    }
}

impl PushConfig {
    /// Load the config of a destination; defaults when the file is absent.
    pub fn load(dest: &Path) -> Result<Self> {
        let config_path = dest.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read push config from {:?}", config_path))?;
        let config: PushConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse push config JSON")?;
        Ok(config)
    }

    /// Save the config into a destination.
    pub fn save(&self, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;
        let config_path = dest.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    pub fn mapping_path(&self, dest: &Path) -> PathBuf {
        dest.join(&self.mapping_db)
    }

    pub fn object_path(&self, dest: &Path) -> PathBuf {
        dest.join(&self.object_dir)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults_when_missing() {
        let tmp = TempDir::new().unwrap();
        let config = PushConfig::load(tmp.path()).unwrap();
        assert_eq!(config, PushConfig::default());
        assert_eq!(config.mapping_path(tmp.path()), tmp.path().join("mapping.sqlite"));
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let config = PushConfig {
            default_ref: "refs/heads/trunk".to_string(),
            remote_url: Some("http://mirror.example/repo".to_string()),
            ..PushConfig::default()
        };
        config.save(tmp.path()).unwrap();
        assert!(!tmp.path().join("dpush.tmp").exists());
        assert_eq!(PushConfig::load(tmp.path()).unwrap(), config);
    }

    #[test]
    fn test_config_partial_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), r#"{"compression_level": 19}"#).unwrap();
        let config = PushConfig::load(tmp.path()).unwrap();
        assert_eq!(config.compression_level, 19);
        assert_eq!(config.default_ref, "refs/heads/master");
    }
}

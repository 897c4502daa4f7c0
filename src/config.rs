//! Configuration
//!
//! Runtime options for the store and the download pipeline. Loaded from a JSON
//! file when one is given; every field has a default so partial files work.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default flush unit. Large enough to amortize per-transaction cost,
/// small enough to bound memory per active download.
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// All configurable options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub download: DownloadSettings,
}

/// Chunk store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// SQLite database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Upper bound on the database size. Writes beyond it fail with
    /// `QuotaExceeded`. `None` = only limited by the disk.
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            max_bytes: None,
        }
    }
}

/// Download pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    /// Bytes accumulated before a chunk is committed.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// User-Agent sent with every fetch.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Capacity of the event channel handed to collaborators.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            user_agent: default_user_agent(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_store_path() -> PathBuf {
    ProjectDirs::from("com", "offline-media", "OfflineMedia")
        .map(|dirs| dirs.data_dir().join("offline-media.sqlite3"))
        .unwrap_or_else(|| PathBuf::from("offline-media.sqlite3"))
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_user_agent() -> String {
    format!("offline-media/{}", env!("CARGO_PKG_VERSION"))
}

fn default_event_buffer() -> usize {
    256
}

impl Config {
    /// Read a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.download.chunk_size == 0 {
            return Err(Error::Config("download.chunk_size must be > 0".to_string()));
        }
        if self.download.event_buffer == 0 {
            return Err(Error::Config("download.event_buffer must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.path = path.into();
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: Option<u64>) -> Self {
        self.store.max_bytes = max_bytes;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.download.chunk_size = chunk_size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.download.chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.download.event_buffer, 256);
        assert!(config.store.max_bytes.is_none());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "download": { "chunk_size": 4096 } }"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.download.chunk_size, 4096);
        assert_eq!(config.download.event_buffer, 256);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.download.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "download": { "chunk_size": 0 } }"#).unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_overrides_apply_on_top_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "store": { "max_bytes": 1024 } }"#).unwrap();

        let config = Config::load(&path)
            .unwrap()
            .with_store_path(dir.path().join("media.db"))
            .with_max_bytes(Some(64 * 1024 * 1024))
            .with_chunk_size(512 * 1024);
        config.validate().unwrap();
        assert_eq!(config.store.path, dir.path().join("media.db"));
        assert_eq!(config.store.max_bytes, Some(64 * 1024 * 1024));
        assert_eq!(config.download.chunk_size, 512 * 1024);

        assert!(matches!(
            config.with_chunk_size(0).validate(),
            Err(Error::Config(_))
        ));
    }
}

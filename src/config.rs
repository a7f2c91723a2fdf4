//! Application configuration: the directory set every operation works
//! against.
//!
//! The config file is JSON, discovered via the platform config
//! directory (`~/.config/romog/config.json` on Linux). It holds the
//! resolved paths from which scans and rebuilds read and to which they
//! write. A missing file yields defaults rooted in the platform data
//! directory, written back on first load so the user has something to
//! edit. Paths are read once at startup and passed around explicitly
//! from there.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Resolved directory set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Where `.cache` files live, one per catalog.
    pub cache_dir: PathBuf,

    /// Files that do not match any catalog entry are moved here,
    /// grouped by the set they came from.
    pub backup_dir: PathBuf,

    /// Root of the catalog tree. Header detectors mirror this layout.
    pub dats_dir: PathBuf,

    /// Header-skipper detectors, a parallel tree to `dats_dir`.
    pub headers_dir: PathBuf,

    /// Staging folder the rebuilder harvests loose files from.
    pub rebuild_dir: PathBuf,

    /// Scratch space, exclusive to one running operation and drained
    /// after each run.
    pub tmp_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let root = ProjectDirs::from("", "", "romog")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        Self::under_root(&root)
    }
}

impl Config {
    /// Platform path of the config file.
    #[must_use]
    pub fn file_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "romog").map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Loads the config file, falling back to (and saving) defaults
    /// when it does not exist. A file that exists but does not parse
    /// is an error rather than silently replaced.
    ///
    /// # Errors
    ///
    /// Returns an error when an existing config file cannot be read or
    /// parsed.
    pub fn load() -> Result<Self> {
        let Some(path) = Self::file_path() else {
            log::warn!("cannot determine config directory; using defaults");
            return Ok(Self::default());
        };
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Self::default();
            if let Err(e) = config.save_to(&path) {
                log::warn!("failed to write default config: {e}");
            }
            Ok(config)
        }
    }

    /// Loads a config from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Writes the config as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Creates every configured directory that does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns the first directory-creation failure.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.cache_dir,
            &self.backup_dir,
            &self.dats_dir,
            &self.headers_dir,
            &self.rebuild_dir,
            &self.tmp_dir,
        ] {
            fs::create_dir_all(dir).map_err(|e| {
                std::io::Error::new(e.kind(), format!("{}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// A config with every directory under `root`. Used by tests and
    /// handy for portable setups.
    #[must_use]
    pub fn under_root(root: &Path) -> Self {
        Self {
            cache_dir: root.join("cache"),
            backup_dir: root.join("backup"),
            dats_dir: root.join("dats"),
            headers_dir: root.join("headers"),
            rebuild_dir: root.join("rebuild"),
            tmp_dir: root.join("tmp"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config::under_root(dir.path());

        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();

        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_ensure_dirs() {
        let dir = tempdir().unwrap();
        let config = Config::under_root(&dir.path().join("deep"));

        config.ensure_dirs().unwrap();
        assert!(config.cache_dir.is_dir());
        assert!(config.tmp_dir.is_dir());
    }
}

//! Top-level configuration: an optional TOML file, overridden by environment variables
//! for the four directory settings.

use std::path::{Path, PathBuf};

use serde::Deserialize;

const DEFAULT_CACHE_MAX_ITEMS: usize = 10_000;
const DEFAULT_VENV_MAX_UNUSED_SECS: u64 = 2 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0:?}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse config file {0:?}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub cache_dir: Option<PathBuf>,
    pub venv_root: Option<PathBuf>,
    pub queue_root: Option<PathBuf>,
    pub sig_dir: Option<PathBuf>,
    pub cache_max_items: Option<usize>,
    pub venv_max_unused_period_secs: Option<u64>,
}

impl RunnerConfig {
    /// Load from `path` if given, falling back to all-default values otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = fs_err::read_to_string(path).map_err(|err| ConfigError::Read(path.to_path_buf(), err))?;
        toml::from_str(&contents).map_err(|err| ConfigError::Parse(path.to_path_buf(), err))
    }

    pub fn cache_max_items(&self) -> usize {
        self.cache_max_items.unwrap_or(DEFAULT_CACHE_MAX_ITEMS)
    }

    pub fn venv_max_unused_period_secs(&self) -> u64 {
        self.venv_max_unused_period_secs.unwrap_or(DEFAULT_VENV_MAX_UNUSED_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_yields_defaults() {
        let config = RunnerConfig::load(None).unwrap();
        assert_eq!(config.cache_max_items(), DEFAULT_CACHE_MAX_ITEMS);
        assert!(config.cache_dir.is_none());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runnerd.toml");
        fs_err::write(&path, "cache_max_items = 42\ncache_dir = \"/tmp/cache\"\n").unwrap();

        let config = RunnerConfig::load(Some(&path)).unwrap();

        assert_eq!(config.cache_max_items(), 42);
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/cache")));
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runnerd.toml");
        fs_err::write(&path, "not valid toml =").unwrap();

        assert!(matches!(RunnerConfig::load(Some(&path)), Err(ConfigError::Parse(_, _))));
    }
}

//! Service configuration for Captioner.
//!
//! Configuration is loaded from the platform config directory
//! (`captioner/config.toml`) with defaults for every field. This covers the
//! service itself; the model's own JSON artifacts are read by
//! [`crate::artifacts`].

mod types;
mod validate;

pub use types::*;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure for Captioner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// HTTP server settings
    pub server: ServerConfig,

    /// Resource limits
    pub limits: LimitsConfig,

    /// Inference worker settings
    pub inference: InferenceConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default configuration if the file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path.
    ///
    /// Uses platform-appropriate directories:
    /// - macOS: ~/Library/Application Support/com.captioner.captioner/config.toml
    /// - Linux: ~/.config/captioner/config.toml
    /// - Windows: C:\Users\<User>\AppData\Roaming\captioner\config\config.toml
    ///
    /// Falls back to ~/.captioner/config.toml if directory detection fails.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "captioner", "captioner")
            .map(|dirs| dirs.config_dir().to_path_buf().join("config.toml"))
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".captioner").join("config.toml")
            })
    }

    /// Get the resolved model directory path (with ~ expansion).
    pub fn model_dir(&self) -> PathBuf {
        let path_str = self.general.model_dir.to_string_lossy();
        let expanded = shellexpand::tilde(&path_str);
        PathBuf::from(expanded.into_owned())
    }

    /// Upload size limit in bytes.
    pub fn max_upload_bytes(&self) -> usize {
        (self.limits.max_upload_mb * 1024 * 1024) as usize
    }

    /// Serialize the config to a pretty TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.upload_field, "imagefileinput");
        assert_eq!(config.inference.workers, 2);
        assert_eq!(config.limits.max_upload_mb, 20);
    }

    #[test]
    fn test_config_to_toml() {
        let config = Config::default();
        let toml = config.to_toml().unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[inference]"));
    }

    #[test]
    fn test_load_from_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 9001\n\n[inference]\nworkers = 1\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.inference.workers, 1);
        // untouched sections keep their defaults
        assert_eq!(config.limits.decode_timeout_ms, 5000);
    }

    #[test]
    fn test_load_from_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[inference]\nworkers = 0\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_model_dir_tilde_expansion() {
        let mut config = Config::default();
        config.general.model_dir = PathBuf::from("~/captioner-models");
        let resolved = config.model_dir();
        assert!(!resolved.to_string_lossy().starts_with('~'));
        assert!(resolved.ends_with("captioner-models"));
    }
}

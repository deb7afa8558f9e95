//! Configuration loading and defaults for autolockd.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for autolockd.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Idle timeout in milliseconds used when a command omits one
    /// (default: 300000, five minutes).
    pub default_timeout_ms: u64,

    /// Command socket path.
    /// If unset, uses $XDG_RUNTIME_DIR/autolockd.sock.
    pub socket_path: Option<PathBuf>,

    /// Show the persistent notification while monitoring (default: true).
    pub show_notification: bool,

    /// Dry run mode: log lock calls instead of issuing them.
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout_ms: 300_000,
            socket_path: None,
            show_notification: true,
            dry_run: false,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from the default path, or return defaults if not found.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let default_path = config_dir.join("autolockd").join("config.toml");
            if default_path.exists() {
                return Self::load(&default_path);
            }
        }

        Ok(Self::default())
    }

    /// Default idle timeout as a duration.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.default_timeout_ms, 300_000);
        assert_eq!(config.default_timeout(), Duration::from_secs(300));
        assert!(config.socket_path.is_none());
        assert!(config.show_notification);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            default_timeout_ms = 60000
            socket_path = "/tmp/autolockd-test.sock"
            show_notification = false
            dry_run = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.default_timeout_ms, 60_000);
        assert_eq!(
            config.socket_path,
            Some(PathBuf::from("/tmp/autolockd-test.sock"))
        );
        assert!(!config.show_notification);
        assert!(config.dry_run);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("default_timeout_ms = 120000").unwrap();
        assert_eq!(config.default_timeout_ms, 120_000);
        assert!(config.show_notification);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = Config::load(Path::new("/nonexistent/autolockd.toml"));
        assert!(err.is_err());
    }
}

//! Client configuration at `~/.tracegate/cli.toml`.
//!
//! Provides the default server address and token. CLI flags and the
//! `TRACEGATE_TOKEN` environment variable always override file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConfig {
    /// Control surface address (host:port).
    #[serde(default = "default_server")]
    pub server: String,

    /// Bearer token (empty = none).
    #[serde(default)]
    pub token: String,

    /// Preset used by `start` when none is given.
    #[serde(default = "default_preset")]
    pub preset: String,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            token: String::new(),
            preset: default_preset(),
        }
    }
}

fn default_server() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_preset() -> String {
    "default".to_string()
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &str) -> Result<Self> {
        let path = Path::new(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.default.server, "127.0.0.1:7878");
        assert_eq!(cfg.default.preset, "default");
        assert!(cfg.default.token.is_empty());
    }

    #[test]
    fn parse_partial_toml_config() {
        let cfg: Config = toml::from_str(
            r#"
[default]
server = "10.0.0.5:7878"
"#,
        )
        .unwrap();
        assert_eq!(cfg.default.server, "10.0.0.5:7878");
        assert_eq!(cfg.default.preset, "default");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.toml");
        std::fs::write(&path, "[default]\ntoken = \"abc\"\npreset = \"cpu\"\n").unwrap();
        let cfg = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.default.token, "abc");
        assert_eq!(cfg.default.preset, "cpu");

        let missing = Config::load(dir.path().join("none.toml").to_str().unwrap()).unwrap();
        assert_eq!(missing.default.server, "127.0.0.1:7878");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.toml");
        std::fs::write(&path, "[default\n").unwrap();
        assert!(Config::load(path.to_str().unwrap()).is_err());
    }
}

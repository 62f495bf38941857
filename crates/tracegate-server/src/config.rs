//! Server configuration: TOML file + CLI overrides.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracegate_core::{Action, ControllerSettings, GovernorPolicy, Preset, TimeoutAction};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub presets: Vec<Preset>,
    #[serde(default)]
    pub principals: Vec<PrincipalSection>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Host identity used in artifact names. Falls back to `$HOSTNAME`.
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,
    /// Seconds a finished session stays listed.
    #[serde(default = "default_retention")]
    pub retention: u64,
    #[serde(default = "default_begin_timeout")]
    pub begin_timeout: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,
    #[serde(default)]
    pub timeout_action: TimeoutAction,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            host_id: None,
            artifact_dir: default_artifact_dir(),
            snapshot_path: default_snapshot_path(),
            sweep_interval_ms: default_sweep_interval_ms(),
            snapshot_interval: default_snapshot_interval(),
            retention: default_retention(),
            begin_timeout: default_begin_timeout(),
            stop_timeout: default_stop_timeout(),
            timeout_action: TimeoutAction::default(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// `[limits]` section. Durations are in seconds unless suffixed.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default = "default_max_per_requester")]
    pub max_concurrent_per_requester: usize,
    #[serde(default = "default_max_duration")]
    pub max_duration: u64,
    #[serde(default = "default_duration")]
    pub default_duration: u64,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_between_starts_ms: u64,
    #[serde(default = "default_starts_per_window")]
    pub starts_per_window: u32,
    #[serde(default = "default_start_window")]
    pub start_window: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_sessions(),
            max_concurrent_per_requester: default_max_per_requester(),
            max_duration: default_max_duration(),
            default_duration: default_duration(),
            min_interval_between_starts_ms: default_min_interval_ms(),
            starts_per_window: default_starts_per_window(),
            start_window: default_start_window(),
        }
    }
}

/// `[[principals]]` entry: who may use the control surface.
#[derive(Debug, Clone, Deserialize)]
pub struct PrincipalSection {
    pub name: String,
    /// Hex SHA-256 of the bearer token (see `tracegated --hash-token`).
    pub token_sha256: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default = "default_actions")]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub max_sessions: Option<usize>,
}

fn default_listen() -> String {
    "127.0.0.1:7878".to_string()
}
fn default_artifact_dir() -> String {
    "~/.tracegate/artifacts".to_string()
}
fn default_snapshot_path() -> String {
    "~/.tracegate/sessions.json".to_string()
}
fn default_sweep_interval_ms() -> u64 {
    1000
}
fn default_snapshot_interval() -> u64 {
    30
}
fn default_retention() -> u64 {
    86400
}
fn default_begin_timeout() -> u64 {
    10
}
fn default_stop_timeout() -> u64 {
    30
}
fn default_event_buffer() -> usize {
    1024
}
fn default_max_sessions() -> usize {
    4
}
fn default_max_per_requester() -> usize {
    2
}
fn default_max_duration() -> u64 {
    600
}
fn default_duration() -> u64 {
    60
}
fn default_min_interval_ms() -> u64 {
    1000
}
fn default_starts_per_window() -> u32 {
    10
}
fn default_start_window() -> u64 {
    60
}
fn default_actions() -> Vec<Action> {
    Action::ALL.to_vec()
}

/// CLI flags that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub max_sessions: Option<usize>,
    pub max_duration: Option<u64>,
    pub artifact_dir: Option<String>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub host_id: String,
    pub artifact_dir: PathBuf,
    pub snapshot_path: PathBuf,
    pub sweep_interval: Duration,
    pub snapshot_interval: Duration,
    pub begin_timeout: Duration,
    pub stop_timeout: Duration,
    pub policy: GovernorPolicy,
    pub settings: ControllerSettings,
    pub presets: Vec<Preset>,
    pub principals: Vec<PrincipalSection>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)
                        .with_context(|| format!("reading {}", expanded.display()))?;
                    toml::from_str::<ConfigFile>(&content)
                        .with_context(|| format!("parsing {}", expanded.display()))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    /// Apply `overrides` to a parsed file and validate the result.
    ///
    /// # Errors
    ///
    /// Fails on zero capacity, zero durations or timeouts, and token hashes
    /// that are not 64 hex characters.
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> Result<Self> {
        let server = file.server;
        let limits = file.limits;

        let max_sessions = overrides.max_sessions.unwrap_or(limits.max_concurrent_sessions);
        let max_duration = overrides.max_duration.unwrap_or(limits.max_duration);
        if max_sessions == 0 {
            bail!("max_concurrent_sessions must be at least 1");
        }
        if max_duration == 0 {
            bail!("max_duration must be positive");
        }
        if server.begin_timeout == 0 || server.stop_timeout == 0 {
            bail!("begin_timeout and stop_timeout must be positive");
        }

        for principal in &file.principals {
            let valid = principal.token_sha256.len() == 64
                && principal.token_sha256.chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                bail!(
                    "principal {}: token_sha256 must be 64 hex characters",
                    principal.name
                );
            }
        }

        let policy = GovernorPolicy {
            max_concurrent_sessions: max_sessions,
            max_concurrent_per_requester: limits.max_concurrent_per_requester.min(max_sessions),
            max_duration: Duration::from_secs(max_duration),
            default_duration: Duration::from_secs(limits.default_duration.min(max_duration)),
            min_interval_between_starts: Duration::from_millis(limits.min_interval_between_starts_ms),
            starts_per_window: limits.starts_per_window,
            start_window: Duration::from_secs(limits.start_window),
        };

        let host_id = server
            .host_id
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string());

        Ok(Self {
            listen: overrides.listen.unwrap_or(server.listen),
            host_id,
            artifact_dir: expand_tilde_str(&overrides.artifact_dir.unwrap_or(server.artifact_dir)),
            snapshot_path: expand_tilde_str(&server.snapshot_path),
            sweep_interval: Duration::from_millis(server.sweep_interval_ms.max(10)),
            snapshot_interval: Duration::from_secs(server.snapshot_interval.max(1)),
            begin_timeout: Duration::from_secs(server.begin_timeout),
            stop_timeout: Duration::from_secs(server.stop_timeout),
            policy,
            settings: ControllerSettings {
                retention: Duration::from_secs(server.retention),
                timeout_action: server.timeout_action,
                event_buffer: server.event_buffer.max(1),
            },
            presets: file.presets,
            principals: file.principals,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(Some(&dir.path().join("missing.toml")), Overrides::default()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7878");
        assert_eq!(config.policy.max_concurrent_sessions, 4);
        assert_eq!(config.policy.default_duration, Duration::from_secs(60));
        assert_eq!(config.settings.timeout_action, TimeoutAction::Collect);
        assert!(config.principals.is_empty());
    }

    #[test]
    fn parses_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            format!(
                r#"
[server]
listen = "0.0.0.0:9000"
host_id = "web-1"
timeout_action = "discard"

[limits]
max_concurrent_sessions = 8
max_duration = 120
default_duration = 300

[[presets]]
name = "cpu"
categories = ["cpu", "sched"]

[[principals]]
name = "alice"
token_sha256 = "{HASH}"
actions = ["start", "stop", "view"]
max_sessions = 1
"#
            ),
        )
        .unwrap();

        let config = ServerConfig::load(
            Some(&path),
            Overrides {
                max_sessions: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.host_id, "web-1");
        assert_eq!(config.policy.max_concurrent_sessions, 2);
        assert_eq!(config.policy.max_concurrent_per_requester, 2);
        // default is capped by the maximum
        assert_eq!(config.policy.default_duration, Duration::from_secs(120));
        assert_eq!(config.settings.timeout_action, TimeoutAction::Discard);
        assert_eq!(config.presets[0].categories, vec!["cpu", "sched"]);
        assert_eq!(config.principals[0].actions, vec![Action::Start, Action::Stop, Action::View]);
        assert_eq!(config.principals[0].max_sessions, Some(1));
    }

    #[test]
    fn rejects_bad_token_hash() {
        let file: ConfigFile = toml::from_str(
            r#"
[[principals]]
name = "bob"
token_sha256 = "plaintext-token"
"#,
        )
        .unwrap();
        assert!(ServerConfig::resolve(file, Overrides::default()).is_err());
    }

    #[test]
    fn rejects_zero_capacity() {
        let overrides = Overrides {
            max_sessions: Some(0),
            ..Default::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), overrides).is_err());
    }

    #[test]
    fn rejects_zero_engine_timeouts() {
        for section in ["[server]\nbegin_timeout = 0\n", "[server]\nstop_timeout = 0\n"] {
            let file: ConfigFile = toml::from_str(section).unwrap();
            let err = ServerConfig::resolve(file, Overrides::default()).unwrap_err();
            assert!(err.to_string().contains("timeout"));
        }
    }

    #[test]
    fn tilde_expansion() {
        let expanded = expand_tilde_str("~/x/y");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("x/y"));
        }
        assert_eq!(expand_tilde_str("/abs"), PathBuf::from("/abs"));
    }
}

//! Runner configuration: environment variables with a file-based override.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 8090;
pub const DEFAULT_LOG_PREFIX: &str = "worker";

/// Sentinel command used when no worker command is configured; fails loudly
/// instead of hanging the session.
pub const MISSING_COMMAND: &str = "echo 'missing worker command for remotest' >&2; exit 1";

const CONFIG_FILE: &str = "remotest.config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Coordinator-side configuration surface.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// Shell command that launches the worker process.
    pub command: String,
    /// TCP port the coordinator listens on.
    pub port: u16,
    /// Prefix applied to every relayed worker output line.
    pub log_prefix: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: MISSING_COMMAND.to_string(),
            port: DEFAULT_PORT,
            log_prefix: DEFAULT_LOG_PREFIX.to_string(),
        }
    }
}

/// File override shape: every field optional, merged over the env defaults.
#[derive(Debug, Default, Deserialize)]
struct FileOverride {
    command: Option<String>,
    port: Option<u16>,
    log_prefix: Option<String>,
}

impl RunnerConfig {
    /// Read `REMOTEST_COMMAND`, `REMOTEST_PORT` and `REMOTEST_PREFIX` from
    /// the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            command: lookup("REMOTEST_COMMAND").unwrap_or(defaults.command),
            port: lookup("REMOTEST_PORT")
                .and_then(|raw| match raw.parse() {
                    Ok(port) => Some(port),
                    Err(_) => {
                        tracing::warn!(%raw, "ignoring unparseable REMOTEST_PORT");
                        None
                    }
                })
                .unwrap_or(defaults.port),
            log_prefix: lookup("REMOTEST_PREFIX").unwrap_or(defaults.log_prefix),
        }
    }

    /// Environment configuration with `remotest.config.json` from the working
    /// directory merged over it, when present.
    pub fn load() -> Result<Self, ConfigError> {
        let dir = std::env::current_dir().unwrap_or_else(|_| ".".into());
        Self::from_env().merge_file(&dir)
    }

    fn merge_file(self, dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(self);
        }
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let overrides: FileOverride =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: display,
                source,
            })?;
        Ok(Self {
            command: overrides.command.unwrap_or(self.command),
            port: overrides.port.unwrap_or(self.port),
            log_prefix: overrides.log_prefix.unwrap_or(self.log_prefix),
        })
    }
}

/// Worker-side transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Coordinator address, `host:port`.
    pub addr: String,
    /// Re-establish the connection after an unexpected close.
    pub reconnect: bool,
    /// Delay before the first reconnect attempt; doubles per failed attempt.
    pub reconnect_delay: Duration,
    /// Cap for the backoff growth.
    pub max_reconnect_delay: Duration,
    /// Give up after this many failed attempts in a row; `None` keeps trying
    /// until the transport is disconnected.
    pub max_attempts: Option<u32>,
}

impl TransportConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_defaults_apply() {
        let config = RunnerConfig::from_lookup(|_| None);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.log_prefix, DEFAULT_LOG_PREFIX);
        assert_eq!(config.command, MISSING_COMMAND);
    }

    #[test]
    fn lookup_values_win_over_defaults() {
        let config = RunnerConfig::from_lookup(|name| match name {
            "REMOTEST_COMMAND" => Some("node worker.js".to_string()),
            "REMOTEST_PORT" => Some("9123".to_string()),
            "REMOTEST_PREFIX" => Some("remote".to_string()),
            _ => None,
        });
        assert_eq!(config.command, "node worker.js");
        assert_eq!(config.port, 9123);
        assert_eq!(config.log_prefix, "remote");
    }

    #[test]
    fn unparseable_port_falls_back() {
        let config = RunnerConfig::from_lookup(|name| match name {
            "REMOTEST_PORT" => Some("not-a-port".to_string()),
            _ => None,
        });
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn file_override_merges_over_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"port": 9999, "command": "cargo run -p worker"}"#,
        )
        .unwrap();

        let config = RunnerConfig::default().merge_file(dir.path()).unwrap();
        assert_eq!(config.port, 9999);
        assert_eq!(config.command, "cargo run -p worker");
        // Untouched field keeps its previous value.
        assert_eq!(config.log_prefix, DEFAULT_LOG_PREFIX);
    }

    #[test]
    fn missing_file_keeps_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig::default().merge_file(dir.path()).unwrap();
        assert_eq!(config, RunnerConfig::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{broken").unwrap();
        let result = RunnerConfig::default().merge_file(dir.path());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}

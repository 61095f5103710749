//! Server configuration.
//!
//! Loading flow:
//! 1. Start with [`ServerConfig::default()`]
//! 2. If a JSON config file is given, its keys override the defaults
//! 3. `HYPERF_*` environment variables override both

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors from reading the config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration for the hyperf server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Outbound queue capacity per connection.
    pub max_send_queue: usize,
    /// Inbound events queued per connection before the socket stops being read.
    pub max_event_queue: usize,
    /// How long the transport waits on an acknowledgment before giving up on it.
    pub ack_timeout_secs: u64,
    /// Ping interval.
    pub heartbeat_interval_secs: u64,
    /// Connections silent for longer than this are dropped.
    pub client_timeout_secs: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9091,
            max_send_queue: 256,
            max_event_queue: 1024,
            ack_timeout_secs: 30,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            max_message_size: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Defaults, overlaid by `path` (if any), overlaid by the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(?path, "loading server config");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `HYPERF_*` overrides read through `lookup`.
    ///
    /// Values that do not parse are ignored and the previous value is kept.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("HYPERF_HOST").filter(|v| !v.trim().is_empty()) {
            self.host = v.trim().to_string();
        }
        if let Some(v) = parse_env(&lookup, "HYPERF_PORT") {
            self.port = v;
        }
        if let Some(v) = parse_env(&lookup, "HYPERF_ACK_TIMEOUT_SECS") {
            self.ack_timeout_secs = v;
        }
        if let Some(v) = parse_env::<usize>(&lookup, "HYPERF_MAX_SEND_QUEUE").filter(|v| *v > 0) {
            self.max_send_queue = v;
        }
        if let Some(v) = parse_env::<usize>(&lookup, "HYPERF_MAX_EVENT_QUEUE").filter(|v| *v > 0) {
            self.max_event_queue = v;
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            debug!(key, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 9091);
        assert_eq!(cfg.max_send_queue, 256);
        assert_eq!(cfg.max_event_queue, 1024);
        assert_eq!(cfg.ack_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.bind_addr(), "127.0.0.1:9091");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: ServerConfig = serde_json::from_str(r#"{"port": 3000}"#).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.client_timeout_secs, 90);
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = ServerConfig::default();
        cfg.apply_env(env(&[
            ("HYPERF_HOST", "0.0.0.0"),
            ("HYPERF_PORT", "8080"),
            ("HYPERF_ACK_TIMEOUT_SECS", "5"),
            ("HYPERF_MAX_SEND_QUEUE", "16"),
            ("HYPERF_MAX_EVENT_QUEUE", "8"),
        ]));
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.ack_timeout_secs, 5);
        assert_eq!(cfg.max_send_queue, 16);
        assert_eq!(cfg.max_event_queue, 8);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut cfg = ServerConfig::default();
        cfg.apply_env(env(&[
            ("HYPERF_PORT", "not-a-port"),
            ("HYPERF_MAX_SEND_QUEUE", "0"),
            ("HYPERF_MAX_EVENT_QUEUE", "0"),
            ("HYPERF_HOST", "  "),
        ]));
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn from_file_reads_json() {
        let path = std::env::temp_dir().join(format!("hyperf-config-{}.json", uuid::Uuid::now_v7()));
        std::fs::write(&path, r#"{"host":"10.0.0.1","ack_timeout_secs":7}"#).unwrap();

        let cfg = ServerConfig::from_file(&path).unwrap();
        assert_eq!(cfg.host, "10.0.0.1");
        assert_eq!(cfg.ack_timeout_secs, 7);
        assert_eq!(cfg.port, 9091);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn from_file_missing_is_io_error() {
        let err = ServerConfig::from_file(Path::new("/nonexistent/hyperf.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn from_file_bad_json_is_parse_error() {
        let path = std::env::temp_dir().join(format!("hyperf-config-{}.json", uuid::Uuid::now_v7()));
        std::fs::write(&path, "{ nope").unwrap();
        let err = ServerConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        std::fs::remove_file(&path).ok();
    }
}

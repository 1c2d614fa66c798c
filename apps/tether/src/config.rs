use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::telemetry::logging::LogLevel;

const SOCKET_NAME: &str = "tether.sock";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    Env { key: &'static str, value: String },
    #[error("unable to determine home directory")]
    NoHome,
}

/// What the route table does when a backlog is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Keep what is queued and reject the new envelope.
    #[default]
    DropNewest,
    /// Evict the oldest queued envelope to make room.
    DropOldest,
}

impl OverflowPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            OverflowPolicy::DropNewest => "drop-newest",
            OverflowPolicy::DropOldest => "drop-oldest",
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop-newest" | "newest" => Ok(OverflowPolicy::DropNewest),
            "drop-oldest" | "oldest" => Ok(OverflowPolicy::DropOldest),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub backlog_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// How long a peer route may stay down, with no job holding it, before
    /// it is forgotten.
    pub down_route_ttl_ms: u64,
    /// Most request correlations kept at once; the oldest go first.
    pub rpc_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: 1024,
            overflow_policy: OverflowPolicy::default(),
            down_route_ttl_ms: 60_000,
            rpc_capacity: 4096,
        }
    }
}

impl RouterConfig {
    pub fn down_route_ttl(&self) -> Duration {
        Duration::from_millis(self.down_route_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub initial_seq: u64,
    pub reorder_max_held: usize,
    pub retired_sessions: usize,
    pub input_queue_depth: usize,
    pub probe_interval_ms: u64,
    pub recovery_window_ms: u64,
    pub stop_grace_ms: u64,
    pub shell: Option<String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            initial_seq: 1,
            reorder_max_held: 256,
            retired_sessions: 16,
            input_queue_depth: 256,
            probe_interval_ms: 5_000,
            recovery_window_ms: 30_000,
            stop_grace_ms: 2_000,
            shell: None,
        }
    }
}

impl JobConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn recovery_window(&self) -> Duration {
        Duration::from_millis(self.recovery_window_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnConfig {
    pub lifecycle_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            lifecycle_timeout_ms: 10_000,
            handshake_timeout_ms: 15_000,
        }
    }
}

impl ConnConfig {
    pub fn lifecycle_timeout(&self) -> Duration {
        Duration::from_millis(self.lifecycle_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub outbound_depth: usize,
    pub max_frame_bytes: usize,
    pub close_grace_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            outbound_depth: 256,
            max_frame_bytes: 8 * 1024 * 1024,
            close_grace_ms: 2_000,
        }
    }
}

impl TransportConfig {
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms.max(1))
    }
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_remote_command() -> String {
    "tether serve --stdio".to_string()
}

/// A named remote the connection manager can bring up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionSpec {
    Ssh {
        target: String,
        #[serde(default = "default_ssh_binary")]
        ssh_binary: String,
        #[serde(default)]
        ssh_flags: Vec<String>,
        #[serde(default = "default_remote_command")]
        remote_command: String,
    },
    Socket {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket_path: Option<PathBuf>,
    pub log_level: Option<LogLevel>,
    pub log_file: Option<PathBuf>,
    pub router: RouterConfig,
    pub jobs: JobConfig,
    pub conn: ConnConfig,
    pub transport: TransportConfig,
    pub connections: BTreeMap<String, ConnectionSpec>,
}

impl Config {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let base = BaseDirs::new().ok_or(ConfigError::NoHome)?;
        Ok(base.home_dir().join(".tether").join("config.toml"))
    }

    /// Reads `path` (or the default location when it exists) and applies
    /// `TETHER_*` overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Ok(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("TETHER_SOCKET") {
            self.socket_path = Some(PathBuf::from(path));
        }
        if let Some(value) = get("TETHER_LOG_LEVEL") {
            self.log_level = Some(
                <LogLevel as clap::ValueEnum>::from_str(value.trim(), true).map_err(|_| {
                    ConfigError::Env {
                        key: "TETHER_LOG_LEVEL",
                        value: value.clone(),
                    }
                })?,
            );
        }
        if let Some(value) = get("TETHER_LOG_FILE") {
            self.log_file = Some(PathBuf::from(value));
        }
        if let Some(value) = get("TETHER_OVERFLOW_POLICY") {
            self.router.overflow_policy =
                value.parse().map_err(|_| ConfigError::Env {
                    key: "TETHER_OVERFLOW_POLICY",
                    value: value.clone(),
                })?;
        }
        parse_env(&get, "TETHER_BACKLOG_CAPACITY", &mut self.router.backlog_capacity)?;
        parse_env(&get, "TETHER_DOWN_ROUTE_TTL_MS", &mut self.router.down_route_ttl_ms)?;
        parse_env(&get, "TETHER_RPC_CAPACITY", &mut self.router.rpc_capacity)?;
        parse_env(&get, "TETHER_REORDER_MAX_HELD", &mut self.jobs.reorder_max_held)?;
        parse_env(&get, "TETHER_PROBE_INTERVAL_MS", &mut self.jobs.probe_interval_ms)?;
        parse_env(&get, "TETHER_RECOVERY_WINDOW_MS", &mut self.jobs.recovery_window_ms)?;
        parse_env(&get, "TETHER_STOP_GRACE_MS", &mut self.jobs.stop_grace_ms)?;
        parse_env(&get, "TETHER_LIFECYCLE_TIMEOUT_MS", &mut self.conn.lifecycle_timeout_ms)?;
        parse_env(&get, "TETHER_HANDSHAKE_TIMEOUT_MS", &mut self.conn.handshake_timeout_ms)?;
        parse_env(&get, "TETHER_OUTBOUND_DEPTH", &mut self.transport.outbound_depth)?;
        parse_env(&get, "TETHER_CLOSE_GRACE_MS", &mut self.transport.close_grace_ms)?;
        if let Some(shell) = get("TETHER_SHELL") {
            self.jobs.shell = Some(shell);
        }
        Ok(())
    }

    pub fn socket_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.socket_path {
            return Ok(path.clone());
        }
        let base = BaseDirs::new().ok_or(ConfigError::NoHome)?;
        let dir = base
            .runtime_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| base.home_dir().join(".tether"));
        Ok(dir.join(SOCKET_NAME))
    }
}

fn parse_env<G, T>(get: &G, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    G: Fn(&'static str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = get(key) {
        *slot = value.trim().parse().map_err(|_| ConfigError::Env {
            key,
            value: value.clone(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_bounded() {
        let config = Config::default();
        assert_eq!(config.router.backlog_capacity, 1024);
        assert_eq!(config.router.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.jobs.initial_seq, 1);
        assert!(config.jobs.reorder_max_held > 0);
    }

    #[test]
    fn toml_sections_and_connections_parse() {
        let raw = r#"
            socket_path = "/tmp/t.sock"

            [router]
            backlog_capacity = 8
            overflow_policy = "drop-oldest"

            [jobs]
            recovery_window_ms = 100

            [connections.hostA]
            type = "ssh"
            target = "me@host-a"

            [connections.local]
            type = "socket"
            path = "/tmp/peer.sock"
        "#;
        let config = Config::from_toml(raw).unwrap();
        assert_eq!(config.router.backlog_capacity, 8);
        assert_eq!(config.router.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.jobs.recovery_window(), Duration::from_millis(100));
        assert_eq!(config.jobs.reorder_max_held, 256);
        match &config.connections["hostA"] {
            ConnectionSpec::Ssh {
                target,
                ssh_binary,
                remote_command,
                ..
            } => {
                assert_eq!(target, "me@host-a");
                assert_eq!(ssh_binary, "ssh");
                assert_eq!(remote_command, "tether serve --stdio");
            }
            other => panic!("unexpected spec {other:?}"),
        }
        assert!(matches!(
            config.connections["local"],
            ConnectionSpec::Socket { .. }
        ));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::from_toml("[router]\nbacklog_capacity = 8\n").unwrap();
        config
            .apply_env(env(&[
                ("TETHER_BACKLOG_CAPACITY", "32"),
                ("TETHER_OVERFLOW_POLICY", "oldest"),
                ("TETHER_LOG_LEVEL", "debug"),
                ("TETHER_SOCKET", "/run/t.sock"),
                ("TETHER_DOWN_ROUTE_TTL_MS", "500"),
                ("TETHER_RPC_CAPACITY", "64"),
            ]))
            .unwrap();
        assert_eq!(config.router.backlog_capacity, 32);
        assert_eq!(config.router.down_route_ttl(), Duration::from_millis(500));
        assert_eq!(config.router.rpc_capacity, 64);
        assert_eq!(config.router.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.log_level, Some(LogLevel::Debug));
        assert_eq!(config.socket_path().unwrap(), PathBuf::from("/run/t.sock"));
    }

    #[test]
    fn malformed_env_value_is_reported() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("TETHER_REORDER_MAX_HELD", "lots")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Env {
                key: "TETHER_REORDER_MAX_HELD",
                ..
            }
        ));
    }
}

//! Configuration system for Fungi.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FUNGI_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/fungi/config.toml
//!   3. ~/.config/fungi/config.toml
//!
//! The loaded value is treated as immutable for the lifetime of the process.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration, shared by the signaling server and the node daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FungiConfig {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub node: NodeConfig,
    pub stun: StunConfig,
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the signaling API binds to.
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// A record not refreshed within this many seconds is expired.
    pub ttl_secs: u64,
    /// How often the background sweep purges expired records.
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node identity. Empty = generated at startup.
    pub node_id: String,
    /// Local UDP address shared by STUN resolution and peer traffic.
    pub bind_addr: String,
    /// Base URL of the signaling server, e.g. "http://10.0.0.1:8080".
    pub server_url: String,
    /// Advertised IP for the local resolver (no STUN). Empty = bound IP.
    pub advertise_ip: String,
    pub heartbeat_interval_secs: u64,
    pub poll_interval_secs: u64,
    /// Keepalive cadence on connected links; holds the NAT mapping open.
    pub keepalive_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StunConfig {
    /// STUN server as "host:port". Empty = resolve to the bound address.
    pub server: String,
    pub base_delay_ms: u64,
    pub max_attempts: u32,
    /// Per-query timeout handed to the STUN client.
    pub query_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Probe rounds before a peer is declared unreachable.
    pub max_rounds: u32,
    /// Wait after the first round; doubles every round.
    pub base_delay_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            sweep_interval_secs: 5,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            bind_addr: "0.0.0.0:5001".to_string(),
            server_url: "http://127.0.0.1:8080".to_string(),
            advertise_ip: String::new(),
            heartbeat_interval_secs: 10,
            poll_interval_secs: 5,
            keepalive_interval_secs: 10,
        }
    }
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            server: "stun.l.google.com:19302".to_string(),
            base_delay_ms: 500,
            max_attempts: 5,
            query_timeout_ms: 2_000,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            base_delay_ms: 500,
        }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl RegistryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl NodeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

impl StunConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl ProbeConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("fungi")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FungiConfig {
    /// Load config: env vars → file → defaults, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            FungiConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FUNGI_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FungiConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply FUNGI_* overrides. `lookup` is `std::env::var` in production.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FUNGI_SERVER__LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        override_parsed(&lookup, "FUNGI_REGISTRY__TTL_SECS", &mut self.registry.ttl_secs);
        override_parsed(
            &lookup,
            "FUNGI_REGISTRY__SWEEP_INTERVAL_SECS",
            &mut self.registry.sweep_interval_secs,
        );
        if let Some(v) = lookup("FUNGI_NODE__NODE_ID") {
            self.node.node_id = v;
        }
        if let Some(v) = lookup("FUNGI_NODE__BIND_ADDR") {
            self.node.bind_addr = v;
        }
        if let Some(v) = lookup("FUNGI_NODE__SERVER_URL") {
            self.node.server_url = v;
        }
        if let Some(v) = lookup("FUNGI_NODE__ADVERTISE_IP") {
            self.node.advertise_ip = v;
        }
        override_parsed(
            &lookup,
            "FUNGI_NODE__HEARTBEAT_INTERVAL_SECS",
            &mut self.node.heartbeat_interval_secs,
        );
        override_parsed(
            &lookup,
            "FUNGI_NODE__POLL_INTERVAL_SECS",
            &mut self.node.poll_interval_secs,
        );
        override_parsed(
            &lookup,
            "FUNGI_NODE__KEEPALIVE_INTERVAL_SECS",
            &mut self.node.keepalive_interval_secs,
        );
        if let Some(v) = lookup("FUNGI_STUN__SERVER") {
            self.stun.server = v;
        }
        override_parsed(&lookup, "FUNGI_STUN__BASE_DELAY_MS", &mut self.stun.base_delay_ms);
        override_parsed(&lookup, "FUNGI_STUN__MAX_ATTEMPTS", &mut self.stun.max_attempts);
        override_parsed(
            &lookup,
            "FUNGI_STUN__QUERY_TIMEOUT_MS",
            &mut self.stun.query_timeout_ms,
        );
        override_parsed(&lookup, "FUNGI_PROBE__MAX_ROUNDS", &mut self.probe.max_rounds);
        override_parsed(&lookup, "FUNGI_PROBE__BASE_DELAY_MS", &mut self.probe.base_delay_ms);
    }

    /// Reject combinations the loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.registry.ttl_secs == 0 {
            return invalid("registry.ttl_secs must be non-zero");
        }
        if self.registry.sweep_interval_secs == 0 {
            return invalid("registry.sweep_interval_secs must be non-zero");
        }
        if self.node.heartbeat_interval_secs == 0 || self.node.poll_interval_secs == 0 {
            return invalid("node heartbeat and poll intervals must be non-zero");
        }
        if self.node.heartbeat_interval_secs >= self.registry.ttl_secs {
            return invalid("node.heartbeat_interval_secs must be below registry.ttl_secs");
        }
        if self.node.keepalive_interval_secs == 0 {
            return invalid("node.keepalive_interval_secs must be non-zero");
        }
        if self.stun.max_attempts == 0 {
            return invalid("stun.max_attempts must be at least 1");
        }
        if self.probe.max_rounds == 0 {
            return invalid("probe.max_rounds must be at least 1");
        }
        Ok(())
    }

    /// True when the heartbeat leaves fewer than three refreshes per TTL window.
    pub fn heartbeat_is_tight(&self) -> bool {
        self.node.heartbeat_interval_secs.saturating_mul(3) > self.registry.ttl_secs
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut T) {
    if let Some(v) = lookup(key) {
        if let Ok(parsed) = v.parse() {
            *field = parsed;
        }
    }
}

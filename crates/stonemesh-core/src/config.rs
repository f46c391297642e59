//! Configuration system for Stonemesh.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $STONEMESH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/stonemesh/config.toml
//!   3. ~/.config/stonemesh/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::access::AccessLevel;
use crate::wire::StoneId;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StonemeshConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub queue: QueueConfig,
    pub reliable: ReliableConfig,
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's Stone ID. Must be non-zero.
    pub stone_id: StoneId,
    /// If false, every permission check passes.
    pub encryption_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface the UDP mesh link is bound to.
    pub interface: String,
    /// UDP port shared by every node on the link.
    pub port: u16,
    /// Hop limit for flooded frames.
    pub ttl: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Outgoing queue slots. Allocated once at startup.
    pub capacity: usize,
    /// Maximum sends per tick.
    pub burst_count: usize,
    /// Tick interval in milliseconds.
    pub process_interval_ms: u64,
    pub repeats: RepeatConfig,
}

/// Default repeat counts for best-effort broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeatConfig {
    pub low: u8,
    pub medium: u8,
    /// Used for switch commands issued from a phone or UART.
    pub high: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliableConfig {
    /// Give up on an unacknowledged reliable send after this long.
    pub timeout_ms: u64,
    /// Retransmit interval while waiting for the acknowledgement.
    pub retry_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Per state type access overrides. Types not listed need Member to get
    /// and Admin to set.
    pub state_overrides: Vec<StateAccessOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateAccessOverride {
    pub state_type: u8,
    pub get: AccessLevel,
    pub set: AccessLevel,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            stone_id: 1,
            encryption_enabled: true,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "lo".to_string(),
            port: 9200,
            ttl: 5,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            burst_count: 3,
            process_interval_ms: 100,
            repeats: RepeatConfig::default(),
        }
    }
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self {
            low: 1,
            medium: 3,
            high: 5,
        }
    }
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry_interval_ms: 500,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("stonemesh")
}

fn home_dir() -> PathBuf {
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
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl StonemeshConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            StonemeshConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("STONEMESH_CONFIG")
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
            let text = toml::to_string_pretty(&StonemeshConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node.stone_id == 0 {
            return Err(ConfigError::Invalid("node.stone_id must be non-zero"));
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue.capacity must be non-zero"));
        }
        Ok(())
    }

    /// Apply STONEMESH_* overrides, reading variables through `lookup`.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("STONEMESH_NODE__STONE_ID").and_then(|v| v.parse().ok()) {
            self.node.stone_id = id;
        }
        if let Some(v) = lookup("STONEMESH_NODE__ENCRYPTION_ENABLED") {
            self.node.encryption_enabled = v == "true" || v == "1";
        }
        if let Some(v) = lookup("STONEMESH_NETWORK__INTERFACE") {
            self.network.interface = v;
        }
        if let Some(p) = lookup("STONEMESH_NETWORK__PORT").and_then(|v| v.parse().ok()) {
            self.network.port = p;
        }
        if let Some(n) = lookup("STONEMESH_QUEUE__CAPACITY").and_then(|v| v.parse().ok()) {
            self.queue.capacity = n;
        }
        if let Some(n) = lookup("STONEMESH_QUEUE__BURST_COUNT").and_then(|v| v.parse().ok()) {
            self.queue.burst_count = n;
        }
    }
}

//! Configuration system for Parley.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PARLEY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/parley/config.toml
//!   3. ~/.config/parley/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub network: NetworkConfig,
    pub reactor: ReactorConfig,
    pub registry: RegistryConfig,
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address both listeners bind to.
    pub bind_addr: String,
    /// Login / heartbeat / text traffic. 0 = OS-assigned.
    pub control_port: u16,
    /// File upload / download traffic. 0 = OS-assigned.
    pub bulk_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Malformed packets in a row before a control connection is dropped.
    pub max_consecutive_decode_errors: u32,
    /// How long a fresh bulk connection has to send its File request.
    pub bulk_handshake_timeout_ms: u64,
    /// Upper bound on a single egress write.
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Liveness sweep period. Client heartbeats must be more frequent.
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Max depth of each queue. 0 = unbounded.
    pub capacity: usize,
    /// What to discard when a bounded queue is full.
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Directory uploads land in and downloads are served from.
    pub repo_path: PathBuf,
    pub chunk_size: usize,
    pub negotiation: Negotiation,
    /// Stop-and-wait acknowledgement per chunk.
    pub acknowledged: bool,
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    /// Pause after the size header so it is not coalesced with the first chunk.
    pub size_guard_ms: u64,
    /// A transfer whose peer makes no progress for this long is aborted.
    /// 0 = wait forever.
    pub io_timeout_ms: u64,
}

/// How the two ends agree on where a transfer stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Negotiation {
    /// An 8-byte total size precedes the data.
    SizeFirst,
    /// Chunks until an empty end marker.
    Sentinel,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            control_port: 9527,
            bulk_port: 9528,
        }
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_decode_errors: 8,
            bulk_handshake_timeout_ms: 30_000,
            write_timeout_ms: 5_000,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 600_000,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 4,
            max_workers: 16,
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("./repo"),
            chunk_size: 1024 * 1024,
            negotiation: Negotiation::SizeFirst,
            acknowledged: false,
            ack_timeout_ms: 500,
            max_retries: 3,
            size_guard_ms: 100,
            io_timeout_ms: 30_000,
        }
    }
}

// ── Durations ─────────────────────────────────────────────────────────────────

impl ReactorConfig {
    pub fn bulk_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl RegistryConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl TransferSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn size_guard(&self) -> Duration {
        Duration::from_millis(self.size_guard_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("parley")
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
    #[error("invalid setting: {0}")]
    Invalid(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ParleyConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read a config file, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PARLEY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&ParleyConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.min_workers == 0 {
            return Err(ConfigError::Invalid("pool.min_workers must be at least 1"));
        }
        if self.pool.max_workers < self.pool.min_workers {
            return Err(ConfigError::Invalid("pool.max_workers is below pool.min_workers"));
        }
        if self.transfer.chunk_size == 0 {
            return Err(ConfigError::Invalid("transfer.chunk_size must be non-zero"));
        }
        if self.registry.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("registry.sweep_interval_ms must be non-zero"));
        }
        Ok(())
    }

    /// Apply PARLEY_* overrides. `get` looks a variable up by name.
    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        let flag = |v: &str| v == "true" || v == "1";

        if let Some(v) = get("PARLEY_NETWORK__BIND_ADDR") {
            self.network.bind_addr = v;
        }
        parse_into(&get, "PARLEY_NETWORK__CONTROL_PORT", &mut self.network.control_port);
        parse_into(&get, "PARLEY_NETWORK__BULK_PORT", &mut self.network.bulk_port);
        parse_into(
            &get,
            "PARLEY_REACTOR__MAX_CONSECUTIVE_DECODE_ERRORS",
            &mut self.reactor.max_consecutive_decode_errors,
        );
        parse_into(
            &get,
            "PARLEY_REACTOR__BULK_HANDSHAKE_TIMEOUT_MS",
            &mut self.reactor.bulk_handshake_timeout_ms,
        );
        parse_into(&get, "PARLEY_REACTOR__WRITE_TIMEOUT_MS", &mut self.reactor.write_timeout_ms);
        parse_into(
            &get,
            "PARLEY_REGISTRY__SWEEP_INTERVAL_MS",
            &mut self.registry.sweep_interval_ms,
        );
        parse_into(&get, "PARLEY_QUEUE__CAPACITY", &mut self.queue.capacity);
        match get("PARLEY_QUEUE__OVERFLOW").as_deref() {
            Some("drop_oldest") => self.queue.overflow = OverflowPolicy::DropOldest,
            Some("drop_newest") => self.queue.overflow = OverflowPolicy::DropNewest,
            _ => {}
        }
        parse_into(&get, "PARLEY_POOL__MIN_WORKERS", &mut self.pool.min_workers);
        parse_into(&get, "PARLEY_POOL__MAX_WORKERS", &mut self.pool.max_workers);
        if let Some(v) = get("PARLEY_TRANSFER__REPO_PATH") {
            self.transfer.repo_path = PathBuf::from(v);
        }
        parse_into(&get, "PARLEY_TRANSFER__CHUNK_SIZE", &mut self.transfer.chunk_size);
        parse_into(&get, "PARLEY_TRANSFER__ACK_TIMEOUT_MS", &mut self.transfer.ack_timeout_ms);
        parse_into(&get, "PARLEY_TRANSFER__MAX_RETRIES", &mut self.transfer.max_retries);
        parse_into(&get, "PARLEY_TRANSFER__SIZE_GUARD_MS", &mut self.transfer.size_guard_ms);
        parse_into(&get, "PARLEY_TRANSFER__IO_TIMEOUT_MS", &mut self.transfer.io_timeout_ms);
        if let Some(v) = get("PARLEY_TRANSFER__ACKNOWLEDGED") {
            self.transfer.acknowledged = flag(&v);
        }
        match get("PARLEY_TRANSFER__NEGOTIATION").as_deref() {
            Some("size_first") => self.transfer.negotiation = Negotiation::SizeFirst,
            Some("sentinel") => self.transfer.negotiation = Negotiation::Sentinel,
            _ => {}
        }
    }
}

fn parse_into<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(v) = get(key).and_then(|v| v.parse().ok()) {
        *slot = v;
    }
}

// Node configuration

use crate::core::{digest_by_name, BlockDigest};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Fatal: the node cannot mine or verify without its digest
    #[error("digest '{0}' is not available")]
    DigestUnavailable(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Block production settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Transactions per block
    pub block_size: usize,
    /// Minimum transaction age before it is batched
    pub max_timeout_ms: u64,
    /// Period of the batcher's seal check
    pub batch_tick_ms: u64,
    /// Wait after broadcasting a hash before the race is resolved
    pub grace_window_ms: u64,
    /// Leading zero bytes required of a block digest
    pub difficulty_zero_bytes: usize,
    pub max_nonce: u64,
    /// Nonces between two preemption checks
    pub cancel_check_interval: u64,
    /// Re-mining attempts after a link conflict
    pub remine_attempts: u32,
    pub digest: String,
    /// How many resolved block ids are remembered to drop late candidates
    pub recent_resolved_capacity: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            block_size: 4,
            max_timeout_ms: 10_000,
            batch_tick_ms: 5_000,
            grace_window_ms: 1_000,
            difficulty_zero_bytes: 1,
            max_nonce: u64::MAX,
            cancel_check_interval: 1,
            remine_attempts: 3,
            digest: "sha256".to_string(),
            recent_resolved_capacity: 256,
        }
    }
}

impl ChainConfig {
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn batch_tick(&self) -> Duration {
        Duration::from_millis(self.batch_tick_ms)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    /// How long a peer's hash may wait for this node to seal the same batch
    pub fn unclaimed_hash_ttl(&self) -> Duration {
        self.max_timeout() + self.batch_tick() + self.grace_window()
    }

    /// Resolve the configured digest; missing primitives are fatal
    pub fn block_digest(&self) -> Result<Arc<dyn BlockDigest>, ConfigError> {
        digest_by_name(&self.digest).ok_or_else(|| ConfigError::DigestUnavailable(self.digest.clone()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::Invalid("block_size must be at least 1".into()));
        }
        if self.cancel_check_interval == 0 {
            return Err(ConfigError::Invalid("cancel_check_interval must be at least 1".into()));
        }
        if self.batch_tick_ms == 0 {
            return Err(ConfigError::Invalid("batch_tick_ms must be at least 1".into()));
        }
        let digest = self.block_digest()?;
        if self.difficulty_zero_bytes > digest.output_len() {
            return Err(ConfigError::Invalid(format!(
                "difficulty of {} bytes exceeds the {}-byte {} digest",
                self.difficulty_zero_bytes,
                digest.output_len(),
                digest.name()
            )));
        }
        Ok(())
    }
}

/// Peer liveness settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive misses tolerated before eviction
    pub miss_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            probe_timeout_ms: 10_000,
            miss_threshold: 3,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat interval_ms must be at least 1".into()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat probe_timeout_ms must be at least 1".into()));
        }
        Ok(())
    }
}

/// Address of a peer as given on the command line or in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    pub address: IpAddr,
    pub heartbeat_port: u16,
    pub service_port: u16,
}

impl PeerAddress {
    /// Parse `host:heartbeat_port:service_port`
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::Invalid(format!("peer '{}' is not host:heartbeat_port:service_port", spec));

        let mut parts = spec.rsplitn(3, ':');
        let service_port = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let heartbeat_port = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;

        let address = (host, heartbeat_port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip())
            .ok_or_else(invalid)?;

        Ok(Self {
            address,
            heartbeat_port,
            service_port,
        })
    }

    pub fn heartbeat_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.heartbeat_port)
    }

    pub fn service_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.service_port)
    }
}

/// Full node configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub host: String,
    pub heartbeat_port: u16,
    pub service_port: u16,
    /// Initial peers as `host:heartbeat_port:service_port`
    pub peers: Vec<String>,
    pub data_dir: PathBuf,
    pub chain: ChainConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            heartbeat_port: 4141,
            service_port: 4142,
            peers: Vec::new(),
            data_dir: PathBuf::from("./data"),
            chain: ChainConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load a TOML config file; missing fields keep their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn peer_addresses(&self) -> Result<Vec<PeerAddress>, ConfigError> {
        self.peers.iter().map(|p| PeerAddress::parse(p)).collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chain.validate()?;
        self.heartbeat.validate()?;
        if self.heartbeat_port != 0 && self.heartbeat_port == self.service_port {
            return Err(ConfigError::Invalid("heartbeat and service ports must differ".into()));
        }
        self.peer_addresses()?;
        Ok(())
    }
}

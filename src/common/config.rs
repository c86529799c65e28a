//! Configuration for quorumkv nodes

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix (`QUORUMKV_PEER_TIMEOUT_MS=500`, ...)
pub const ENV_PREFIX: &str = "QUORUMKV";

/// Process-level configuration, layered from an optional TOML file and
/// `QUORUMKV_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging level used when `RUST_LOG` is not set
    pub log_level: String,

    /// Host the local nodes bind and advertise
    pub host: String,

    /// Number of nodes started by `quorumkv-node cluster`
    pub nodes: usize,

    /// First HTTP port; node `i` listens on `base_http_port + i`
    pub base_http_port: u16,

    /// First gRPC port; node `i` listens on `base_grpc_port + i`
    pub base_grpc_port: u16,

    /// Root directory for per-node WAL files
    pub data_dir: PathBuf,

    pub wal_sync: WalSyncPolicy,

    pub election_recheck_ms: u64,

    pub peer_timeout_ms: u64,

    pub membership_retry_ms: u64,

    /// ZooKeeper ensemble used by `quorumkv-node serve`
    pub zk_hosts: String,

    /// How long `serve` waits for a ZooKeeper session
    pub zk_timeout_ms: u64,

    /// Node ID for `serve`; defaults to `node-<grpc port>`
    pub node_id: Option<String>,

    /// Address `serve` publishes under `/workers`
    pub advertise_addr: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            host: "127.0.0.1".to_string(),
            nodes: 3,
            base_http_port: 8081,
            base_grpc_port: 9081,
            data_dir: PathBuf::from("./quorumkv-data"),
            wal_sync: WalSyncPolicy::default(),
            election_recheck_ms: default_election_recheck(),
            peer_timeout_ms: default_peer_timeout(),
            membership_retry_ms: default_membership_retry(),
            zk_hosts: "127.0.0.1:2181".to_string(),
            zk_timeout_ms: 5_000,
            node_id: None,
            advertise_addr: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_election_recheck() -> u64 {
    10_000
}
fn default_peer_timeout() -> u64 {
    2_000
}
fn default_membership_retry() -> u64 {
    1_000
}

impl Config {
    /// Load configuration. A missing file is not an error; defaults apply.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.nodes == 0 {
            return Err(crate::Error::InvalidConfig("nodes must be at least 1".into()));
        }
        if self.peer_timeout_ms == 0
            || self.election_recheck_ms == 0
            || self.zk_timeout_ms == 0
        {
            return Err(crate::Error::InvalidConfig(
                "timeouts must be non-zero".into(),
            ));
        }
        let last = self.nodes.saturating_sub(1);
        if usize::from(self.base_http_port) + last > u16::MAX as usize
            || usize::from(self.base_grpc_port) + last > u16::MAX as usize
        {
            return Err(crate::Error::InvalidConfig("port range overflows".into()));
        }
        Ok(())
    }

    /// Derive the configuration of the `index`-th local node.
    pub fn node(&self, index: usize) -> crate::Result<NodeConfig> {
        let http_addr = format!("{}:{}", self.host, self.base_http_port as usize + index)
            .parse()
            .map_err(|e| crate::Error::InvalidConfig(format!("http address: {}", e)))?;
        let grpc_addr: SocketAddr = format!("{}:{}", self.host, self.base_grpc_port as usize + index)
            .parse()
            .map_err(|e| crate::Error::InvalidConfig(format!("grpc address: {}", e)))?;
        Ok(NodeConfig {
            node_id: format!("node-{}", index + 1),
            http_addr,
            grpc_addr,
            advertise_addr: None,
            data_dir: self.data_dir.clone(),
            wal_sync: self.wal_sync,
            election_recheck_ms: self.election_recheck_ms,
            peer_timeout_ms: self.peer_timeout_ms,
            membership_retry_ms: self.membership_retry_ms,
        })
    }
}

impl Config {
    /// Configuration of the one node run by `quorumkv-node serve`, on
    /// `base_http_port` and `base_grpc_port`.
    pub fn standalone(&self) -> crate::Result<NodeConfig> {
        let mut node = self.node(0)?;
        node.node_id = self
            .node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", self.base_grpc_port));
        node.advertise_addr = self.advertise_addr.clone();
        Ok(node)
    }

    pub fn zk_timeout(&self) -> Duration {
        Duration::from_millis(self.zk_timeout_ms)
    }
}

/// Configuration of a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ID (unique identifier, also names the WAL file)
    pub node_id: String,

    /// Bind address for the HTTP API
    pub http_addr: SocketAddr,

    /// Bind address for the peer replication gRPC service
    pub grpc_addr: SocketAddr,

    /// Address published under `/workers` (defaults to `grpc_addr`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_addr: Option<String>,

    /// Directory holding the WAL file
    pub data_dir: PathBuf,

    #[serde(default)]
    pub wal_sync: WalSyncPolicy,

    /// Election recheck interval when no watch event arrives
    #[serde(default = "default_election_recheck")]
    pub election_recheck_ms: u64,

    /// Per-call timeout for replicate/commit RPCs
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_ms: u64,

    /// Delay before re-reading the worker set after a failed read
    #[serde(default = "default_membership_retry")]
    pub membership_retry_ms: u64,
}

impl NodeConfig {
    pub fn advertise(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.grpc_addr.to_string())
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(format!("wal_{}.log", self.node_id))
    }

    pub fn election_recheck(&self) -> Duration {
        Duration::from_millis(self.election_recheck_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn membership_retry(&self) -> Duration {
        Duration::from_millis(self.membership_retry_ms)
    }
}

/// When WAL appends reach the disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncPolicy {
    /// fsync after every record
    #[default]
    Always,
    /// flush to the OS after every record
    Interval,
    Never,
}

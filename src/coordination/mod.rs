//! Coordination service boundary
//!
//! quorumkv does not implement consensus for its control plane. It consumes a
//! ZooKeeper-style service through [`Coordination`]: a hierarchical namespace
//! with ephemeral and sequential nodes, children listing, get/set and one-shot
//! watches. [`zookeeper::ZkCoordination`] talks to a real ensemble, one
//! session per node process. [`memory::MemCoordination`] is the embedded
//! backend used by the local cluster runner and the tests.

pub mod memory;
pub mod zookeeper;

use crate::common::{Error, Result};
use tokio::sync::oneshot;

pub use memory::{MemCoordination, MemSession};
pub use zookeeper::ZkCoordination;

/// Election participants (ephemeral-sequential)
pub const ELECTION_PATH: &str = "/election";
/// Registered followers; payload is the follower's peer address
pub const WORKERS_PATH: &str = "/workers";
/// Registered leader
pub const MASTER_PATH: &str = "/master";
/// Last committed cluster version, JSON-encoded integer
pub const VERSION_PATH: &str = "/version";

/// Prefix of election node names, followed by the sequence number
pub const ELECTION_NODE_PREFIX: &str = "node_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Deleted when the creating session ends
    Ephemeral,
    /// Ephemeral, with a per-parent monotonically increasing suffix
    EphemeralSequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    /// The session holding the watch ended before it fired
    SessionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: EventKind,
    pub path: String,
}

/// One-shot notification armed by a `*_watch` call.
#[derive(Debug)]
pub struct Watch {
    path: String,
    rx: oneshot::Receiver<WatchedEvent>,
}

impl Watch {
    /// Create a watch and the sender that fires it.
    pub fn pair(path: &str) -> (oneshot::Sender<WatchedEvent>, Watch) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Watch {
                path: path.to_string(),
                rx,
            },
        )
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the watch to fire.
    pub async fn changed(self) -> WatchedEvent {
        match self.rx.await {
            Ok(event) => event,
            Err(_) => WatchedEvent {
                kind: EventKind::SessionClosed,
                path: self.path,
            },
        }
    }
}

/// Client view of the coordination service, bound to one session.
#[tonic::async_trait]
pub trait Coordination: Send + Sync {
    /// Create a node; returns the actual path (with the sequence suffix for
    /// sequential nodes).
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String>;

    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Read a node and watch it for data changes or deletion.
    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, Watch)>;

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Child names (not full paths), unsorted.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)>;

    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Join a parent path and a child name.
pub fn child_path(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child)
}

/// Last path component.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Create a persistent node unless it already exists.
pub async fn ensure_node(coord: &dyn Coordination, path: &str, data: &[u8]) -> Result<()> {
    match coord.create(path, data.to_vec(), CreateMode::Persistent).await {
        Ok(_) | Err(Error::NodeExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create the well-known paths. Safe to call from every node.
pub async fn bootstrap(coord: &dyn Coordination) -> Result<()> {
    ensure_node(coord, ELECTION_PATH, b"").await?;
    ensure_node(coord, WORKERS_PATH, b"").await?;
    ensure_node(coord, MASTER_PATH, b"").await?;
    ensure_node(coord, VERSION_PATH, &serde_json::to_vec(&0u64)?).await?;
    Ok(())
}

/// Read the cluster's last committed version from `/version`.
pub async fn read_commit_pointer(coord: &dyn Coordination) -> Result<u64> {
    let data = coord.get(VERSION_PATH).await?;
    serde_json::from_slice(&data)
        .map_err(|e| Error::CoordinationUnavailable(format!("malformed {}: {}", VERSION_PATH, e)))
}

/// Overwrite `/version`.
pub async fn write_commit_pointer(coord: &dyn Coordination, version: u64) -> Result<()> {
    coord.set(VERSION_PATH, serde_json::to_vec(&version)?).await
}

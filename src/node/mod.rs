//! A quorumkv node
//!
//! Wires election, membership, the WAL and replication around a local
//! key-value map. The leader originates writes; followers only apply what the
//! leader replicated and serve reads.
//!
//! Write path on the leader:
//!
//! ```text
//! WAL append (pending) ─▶ propose (quorum) ─▶ commit broadcast ─▶ /version ─▶ local store
//! ```

pub mod grpc;
pub mod http;
pub mod peer_client;
pub mod replication;
pub mod server;
pub mod wal;

use crate::cluster::{ElectionEngine, ElectionState, MembershipSnapshot, MembershipTracker, Role};
use crate::common::{validate_key, Error, KVStore, MemStore, NodeConfig, Result, METRICS};
use crate::coordination::{bootstrap, Coordination};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;

pub use peer_client::GrpcPeerTransport;
pub use replication::{PeerTransport, ReplicationCoordinator};
pub use server::NodeServer;
pub use wal::{Operation, WalEntry, WalManager, WriteIntent};

/// Background tasks started by [`Node::start`].
pub struct NodeTasks {
    /// Ends with `Ok` on promotion; an error means the role is unknown
    pub election: JoinHandle<Result<()>>,
    pub membership: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub state: ElectionState,
    pub role: Option<Role>,
    pub election_node: Option<String>,
    pub advertise_addr: String,
    pub membership: MembershipSnapshot,
    pub last_version: u64,
    pub last_committed: u64,
    pub pending: usize,
    /// None when the coordination service cannot be read
    pub commit_pointer: Option<u64>,
    pub keys: usize,
}

pub struct Node {
    config: NodeConfig,
    coord: Arc<dyn Coordination>,
    election: Arc<ElectionEngine>,
    membership: Arc<MembershipTracker>,
    wal: Arc<WalManager>,
    replication: ReplicationCoordinator,
    store: Arc<dyn KVStore>,
    /// key -> version last applied to `store`
    applied: Mutex<HashMap<String, u64>>,
}

impl Node {
    /// Open the WAL and rebuild the local store from its committed entries.
    pub fn new(
        config: NodeConfig,
        coord: Arc<dyn Coordination>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        let wal = Arc::new(WalManager::open(
            config.wal_path(),
            config.wal_sync,
            coord.clone(),
        )?);
        let membership = Arc::new(MembershipTracker::new(
            coord.clone(),
            config.membership_retry(),
        ));
        let election = Arc::new(ElectionEngine::new(
            coord.clone(),
            config.advertise(),
            config.election_recheck(),
        ));
        let replication = ReplicationCoordinator::new(
            coord.clone(),
            membership.clone(),
            transport,
            config.peer_timeout(),
        );

        let node = Self {
            config,
            coord,
            election,
            membership,
            wal,
            replication,
            store: Arc::new(MemStore::new()),
            applied: Mutex::new(HashMap::new()),
        };
        node.recover_store()?;
        Ok(node)
    }

    fn recover_store(&self) -> Result<()> {
        let mut committed: Vec<WalEntry> = wal::WalReplay::read(self.wal.path())?
            .entries
            .into_iter()
            .filter(|entry| entry.committed)
            .collect();
        committed.sort_by_key(|entry| entry.version);

        let mut applied = 0usize;
        for entry in &committed {
            if self.apply(entry) {
                applied += 1;
            }
        }
        if applied > 0 {
            tracing::info!(node = %self.config.node_id, applied, "store rebuilt from WAL");
        }
        Ok(())
    }

    /// Join the cluster. Returns once this node knows its role.
    pub async fn start(&self) -> Result<NodeTasks> {
        bootstrap(self.coord.as_ref()).await?;
        let election = self.election.start().await?;
        let membership = self.membership.start().await?;
        tracing::info!(
            node = %self.config.node_id,
            role = ?self.election.role(),
            addr = %self.config.advertise(),
            "node started"
        );
        Ok(NodeTasks {
            election,
            membership,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn election(&self) -> &Arc<ElectionEngine> {
        &self.election
    }

    pub fn membership(&self) -> &Arc<MembershipTracker> {
        &self.membership
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    /// Local key-value map, for inspection regardless of role.
    pub fn store(&self) -> &Arc<dyn KVStore> {
        &self.store
    }

    pub fn role(&self) -> Option<Role> {
        self.election.role()
    }

    fn require_role(&self, role: Role, message: &str) -> Result<()> {
        if self.election.role() == Some(role) {
            Ok(())
        } else {
            Err(Error::RoleViolation(format!(
                "{} ({} is {})",
                message,
                self.config.node_id,
                self.role_name()
            )))
        }
    }

    fn role_name(&self) -> String {
        match self.election.role() {
            Some(role) => role.to_string(),
            None => "electing".to_string(),
        }
    }

    /// Replicated PUT; returns the committed version.
    pub async fn put(&self, key: &str, value: String) -> Result<u64> {
        validate_key(key)?;
        self.write(WriteIntent::put(key, value)).await
    }

    /// Replicated DELETE; returns the committed version.
    pub async fn delete(&self, key: &str) -> Result<u64> {
        validate_key(key)?;
        self.write(WriteIntent::delete(key)).await
    }

    async fn write(&self, intent: WriteIntent) -> Result<u64> {
        let start = Instant::now();
        let result = self.replicate_write(intent).await;
        METRICS.record_write(start.elapsed(), &result);
        if let Err(e) = &result {
            tracing::warn!(node = %self.config.node_id, kind = e.kind(), "write rejected: {}", e);
        }
        result
    }

    async fn replicate_write(&self, intent: WriteIntent) -> Result<u64> {
        self.require_role(Role::Leader, "writes are only accepted by the leader")?;

        let entry = self.wal.append(intent).await?;
        let proposal = self.replication.propose(&entry).await?;
        let commit = self.replication.commit(&entry).await?;
        self.wal.record_commit(entry.version).await?;
        self.apply(&entry);

        tracing::info!(
            node = %self.config.node_id,
            version = entry.version,
            op = %entry.operation,
            key = %entry.key,
            acks = proposal.acks,
            quorum = proposal.quorum,
            commit_acks = commit.acks,
            "write committed"
        );
        Ok(entry.version)
    }

    /// Read from the local store. Only followers serve reads.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        if let Err(e) = self.require_role(Role::Follower, "reads are served by followers") {
            METRICS.role_violations.inc();
            return Err(e);
        }
        Ok(self.store.get(key))
    }

    /// Phase 1 on a follower: append as pending. Returns false for a
    /// version already in the log.
    pub async fn handle_replicate(&self, entry: WalEntry) -> Result<bool> {
        if let Err(e) = self.require_role(Role::Follower, "replicate sent to a non-follower") {
            METRICS.role_violations.inc();
            tracing::warn!(version = entry.version, "{}", e);
            return Err(e);
        }
        let appended = self.wal.append_replicated(&entry).await?;
        METRICS.replicates_received.inc();
        tracing::debug!(node = %self.config.node_id, version = entry.version, appended, "replicate");
        Ok(appended)
    }

    /// Phase 2 on a follower: mark committed and apply. Applying the same
    /// version again is a no-op. Returns whether the store changed.
    pub async fn handle_commit(&self, entry: WalEntry) -> Result<bool> {
        if let Err(e) = self.require_role(Role::Follower, "commit sent to a non-follower") {
            METRICS.role_violations.inc();
            tracing::warn!(version = entry.version, "{}", e);
            return Err(e);
        }
        self.wal.commit_replicated(&entry).await?;
        let applied = self.apply(&entry);
        if applied {
            METRICS.commits_applied.inc();
        }
        tracing::debug!(node = %self.config.node_id, version = entry.version, applied, "commit");
        Ok(applied)
    }

    /// Apply a committed entry unless this key already holds the same or a
    /// newer version.
    fn apply(&self, entry: &WalEntry) -> bool {
        let mut applied = self.applied.lock().unwrap_or_else(|p| p.into_inner());
        let last = applied.get(&entry.key).copied().unwrap_or(0);
        if entry.version <= last {
            return false;
        }
        entry.apply_to(self.store.as_ref());
        applied.insert(entry.key.clone(), entry.version);
        true
    }

    pub async fn status(&self) -> NodeStatus {
        let wal = self.wal.status().await;
        let commit_pointer = match self.wal.commit_pointer().await {
            Ok(pointer) => Some(pointer),
            Err(e) => {
                tracing::debug!("commit pointer unavailable: {}", e);
                None
            }
        };
        let state = self.election.state();
        NodeStatus {
            node_id: self.config.node_id.clone(),
            state,
            role: state.role(),
            election_node: self.election.node_path().map(str::to_string),
            advertise_addr: self.config.advertise(),
            membership: self.membership.snapshot(),
            last_version: wal.last_version,
            last_committed: wal.last_committed,
            pending: wal.pending,
            commit_pointer,
            keys: self.store.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::WalSyncPolicy;
    use crate::coordination::{MemCoordination, MemSession};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NoPeers;

    #[tonic::async_trait]
    impl PeerTransport for NoPeers {
        async fn replicate(&self, addr: &str, _entry: &WalEntry) -> Result<()> {
            Err(Error::PeerUnreachable {
                peer: addr.into(),
                reason: "no transport".into(),
            })
        }

        async fn commit(&self, addr: &str, _entry: &WalEntry) -> Result<()> {
            Err(Error::PeerUnreachable {
                peer: addr.into(),
                reason: "no transport".into(),
            })
        }
    }

    /// Acks every call; the first commit broadcast also takes the
    /// coordination service down.
    struct OutageOnCommit {
        ensemble: MemCoordination,
        armed: AtomicBool,
    }

    #[tonic::async_trait]
    impl PeerTransport for OutageOnCommit {
        async fn replicate(&self, _addr: &str, _entry: &WalEntry) -> Result<()> {
            Ok(())
        }

        async fn commit(&self, _addr: &str, _entry: &WalEntry) -> Result<()> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.ensemble.set_available(false);
            }
            Ok(())
        }
    }

    fn node_config(dir: &std::path::Path, id: &str) -> NodeConfig {
        NodeConfig {
            node_id: id.into(),
            http_addr: "127.0.0.1:0".parse().unwrap(),
            grpc_addr: "127.0.0.1:0".parse().unwrap(),
            advertise_addr: Some(format!("{}.local:9000", id)),
            data_dir: dir.to_path_buf(),
            wal_sync: WalSyncPolicy::Always,
            election_recheck_ms: 100,
            peer_timeout_ms: 100,
            membership_retry_ms: 10,
        }
    }

    fn node(dir: &std::path::Path, id: &str, session: MemSession) -> Node {
        Node::new(node_config(dir, id), Arc::new(session), Arc::new(NoPeers)).unwrap()
    }

    #[tokio::test]
    async fn test_roles_gate_reads_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let ensemble = MemCoordination::new();

        let leader = node(dir.path(), "node-1", ensemble.session());
        let _leader_tasks = leader.start().await.unwrap();
        let follower = node(dir.path(), "node-2", ensemble.session());
        let _follower_tasks = follower.start().await.unwrap();

        assert_eq!(leader.role(), Some(Role::Leader));
        assert_eq!(follower.role(), Some(Role::Follower));

        assert!(matches!(leader.get("a"), Err(Error::RoleViolation(_))));
        assert!(matches!(
            follower.put("a", "1".into()).await,
            Err(Error::RoleViolation(_))
        ));
        assert!(matches!(
            follower.delete("a").await,
            Err(Error::RoleViolation(_))
        ));
        assert_eq!(follower.get("a").unwrap(), None);

        let entry = WalEntry {
            version: 1,
            operation: Operation::Put,
            key: "a".into(),
            value: "1".into(),
            committed: false,
        };
        let err = leader.handle_replicate(entry.clone()).await.unwrap_err();
        assert!(matches!(err, Error::RoleViolation(_)));
        assert!(!err.is_retryable());
        assert!(leader.handle_commit(entry).await.is_err());
        assert_eq!(leader.wal().status().await.last_version, 0);
    }

    #[tokio::test]
    async fn test_unreachable_followers_leave_leader_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let ensemble = MemCoordination::new();

        let leader = node(dir.path(), "node-1", ensemble.session());
        let _leader_tasks = leader.start().await.unwrap();
        let follower = node(dir.path(), "node-2", ensemble.session());
        let _follower_tasks = follower.start().await.unwrap();

        let err = leader.put("a", "1".into()).await.unwrap_err();
        assert!(matches!(err, Error::QuorumNotReached { acks: 0, quorum: 1 }));
        assert_eq!(leader.store().get("a"), None);

        let status = leader.status().await;
        assert_eq!(status.pending, 1);
        assert_eq!(status.commit_pointer, Some(0));
    }

    #[tokio::test]
    async fn test_pointer_outage_after_commit_broadcast_does_not_wedge_leader() {
        let dir = tempfile::tempdir().unwrap();
        let ensemble = MemCoordination::new();
        let transport = Arc::new(OutageOnCommit {
            ensemble: ensemble.clone(),
            armed: AtomicBool::new(true),
        });

        let leader = Node::new(
            node_config(dir.path(), "node-1"),
            Arc::new(ensemble.session()),
            transport.clone(),
        )
        .unwrap();
        let _leader_tasks = leader.start().await.unwrap();
        let follower = node(dir.path(), "node-2", ensemble.session());
        let _follower_tasks = follower.start().await.unwrap();

        let err = leader.put("a", "1".into()).await.unwrap_err();
        assert!(matches!(err, Error::CoordinationUnavailable(_)));
        assert_eq!(leader.store().get("a"), None);
        ensemble.set_available(true);

        let status = leader.wal().status().await;
        assert_eq!(status.last_committed, 0);
        assert_eq!(status.pending, 1);
        assert_eq!(leader.wal().commit_pointer().await.unwrap(), 0);

        // once the service is back the leader keeps writing
        assert_eq!(leader.put("b", "2".into()).await.unwrap(), 2);
        assert_eq!(leader.wal().commit_pointer().await.unwrap(), 2);

        // the failed write is not resurrected by a restart
        let restarted = Node::new(
            node_config(dir.path(), "node-1"),
            Arc::new(ensemble.session()),
            transport,
        )
        .unwrap();
        assert_eq!(restarted.store().get("a"), None);
        assert_eq!(restarted.store().get("b"), Some("2".to_string()));
        assert_eq!(restarted.wal().status().await.last_committed, 2);
    }

    #[tokio::test]
    async fn test_follower_commit_applies_once() {
        let dir = tempfile::tempdir().unwrap();
        let ensemble = MemCoordination::new();

        let leader = node(dir.path(), "node-1", ensemble.session());
        let _leader_tasks = leader.start().await.unwrap();
        let follower = node(dir.path(), "node-2", ensemble.session());
        let _follower_tasks = follower.start().await.unwrap();

        let put = WalEntry {
            version: 1,
            operation: Operation::Put,
            key: "a".into(),
            value: "1".into(),
            committed: false,
        };
        assert!(follower.handle_replicate(put.clone()).await.unwrap());
        assert!(follower.handle_commit(put.clone()).await.unwrap());
        assert!(!follower.handle_commit(put.clone()).await.unwrap());
        assert_eq!(follower.get("a").unwrap(), Some("1".to_string()));

        // an older commit arriving late never overwrites a newer value
        let newer = WalEntry {
            version: 3,
            value: "3".into(),
            ..put.clone()
        };
        let older = WalEntry {
            version: 2,
            value: "2".into(),
            ..put
        };
        follower.handle_commit(newer).await.unwrap();
        assert!(!follower.handle_commit(older).await.unwrap());
        assert_eq!(follower.get("a").unwrap(), Some("3".to_string()));
    }

    #[tokio::test]
    async fn test_store_is_rebuilt_from_committed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let ensemble = MemCoordination::new();

        {
            let leader = node(dir.path(), "node-1", ensemble.session());
            let _leader_tasks = leader.start().await.unwrap();
            let follower = node(dir.path(), "node-2", ensemble.session());
            let _follower_tasks = follower.start().await.unwrap();

            for (version, op, value) in [
                (1, Operation::Put, "x"),
                (2, Operation::Put, "y"),
                (3, Operation::Delete, ""),
            ] {
                let key = if version == 2 { "b" } else { "a" };
                let entry = WalEntry {
                    version,
                    operation: op,
                    key: key.into(),
                    value: value.into(),
                    committed: false,
                };
                follower.handle_replicate(entry.clone()).await.unwrap();
                follower.handle_commit(entry).await.unwrap();
            }
            // prepared, never committed
            follower
                .handle_replicate(WalEntry {
                    version: 4,
                    operation: Operation::Put,
                    key: "c".into(),
                    value: "z".into(),
                    committed: false,
                })
                .await
                .unwrap();
        }

        let restarted = node(dir.path(), "node-2", ensemble.session());
        assert_eq!(restarted.store().get("a"), None);
        assert_eq!(restarted.store().get("b"), Some("y".to_string()));
        assert_eq!(restarted.store().get("c"), None);
        assert_eq!(restarted.wal().status().await.last_committed, 3);
    }

    #[tokio::test]
    async fn test_invalid_key_is_rejected_before_role_check() {
        let dir = tempfile::tempdir().unwrap();
        let ensemble = MemCoordination::new();
        let leader = node(dir.path(), "node-1", ensemble.session());
        let _tasks = leader.start().await.unwrap();

        assert!(matches!(
            leader.put("", "v".into()).await,
            Err(Error::InvalidKey(_))
        ));
    }
}

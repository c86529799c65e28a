//! Shared helpers for quorumkv integration tests

#![allow(dead_code)]

use quorumkv::cluster::ElectionState;
use quorumkv::common::{NodeConfig, WalSyncPolicy};
use quorumkv::coordination::{MemCoordination, MemSession};
use quorumkv::node::{NodeTasks, PeerTransport, WalEntry};
use quorumkv::{Error, Node, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Routes replication calls to in-process nodes by address. Addresses in
/// the `down` set behave like unreachable peers.
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    down: Mutex<HashSet<String>>,
}

impl LocalTransport {
    pub fn register(&self, node: Arc<Node>) {
        let addr = node.config().advertise();
        self.nodes.write().unwrap().insert(addr, node);
    }

    pub fn set_down(&self, addr: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(addr.to_string());
        } else {
            set.remove(addr);
        }
    }

    fn target(&self, addr: &str) -> Result<Arc<Node>> {
        if self.down.lock().unwrap().contains(addr) {
            return Err(Error::PeerUnreachable {
                peer: addr.into(),
                reason: "connection refused".into(),
            });
        }
        self.nodes
            .read()
            .unwrap()
            .get(addr)
            .cloned()
            .ok_or_else(|| Error::PeerUnreachable {
                peer: addr.into(),
                reason: "unknown address".into(),
            })
    }
}

#[tonic::async_trait]
impl PeerTransport for LocalTransport {
    async fn replicate(&self, addr: &str, entry: &WalEntry) -> Result<()> {
        self.target(addr)?.handle_replicate(entry.clone()).await?;
        Ok(())
    }

    async fn commit(&self, addr: &str, entry: &WalEntry) -> Result<()> {
        self.target(addr)?.handle_commit(entry.clone()).await?;
        Ok(())
    }
}

pub fn node_config(dir: &Path, id: &str) -> NodeConfig {
    NodeConfig {
        node_id: id.into(),
        http_addr: "127.0.0.1:0".parse().unwrap(),
        grpc_addr: "127.0.0.1:0".parse().unwrap(),
        advertise_addr: Some(id.to_string()),
        data_dir: dir.to_path_buf(),
        wal_sync: WalSyncPolicy::Always,
        election_recheck_ms: 200,
        peer_timeout_ms: 200,
        membership_retry_ms: 20,
    }
}

pub struct TestNode {
    pub node: Arc<Node>,
    pub session: Arc<MemSession>,
    pub tasks: NodeTasks,
}

/// A cluster whose nodes talk through a [`LocalTransport`]. Nodes are
/// started in order, so `nodes[0]` leads.
pub struct TestCluster {
    pub ensemble: MemCoordination,
    pub transport: Arc<LocalTransport>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    pub async fn start(dir: &Path, size: usize) -> Self {
        let ensemble = MemCoordination::new();
        let transport = Arc::new(LocalTransport::default());
        let mut cluster = Self {
            ensemble,
            transport,
            nodes: Vec::new(),
        };
        for i in 0..size {
            cluster.add_node(dir, &format!("node-{}", i + 1)).await;
        }
        cluster
    }

    pub async fn add_node(&mut self, dir: &Path, id: &str) -> &TestNode {
        let session = Arc::new(self.ensemble.session());
        let node = Arc::new(
            Node::new(node_config(dir, id), session.clone(), self.transport.clone()).unwrap(),
        );
        self.transport.register(node.clone());
        let tasks = node.start().await.unwrap();
        self.nodes.push(TestNode {
            node,
            session,
            tasks,
        });
        self.nodes.last().unwrap()
    }

    pub fn leader(&self) -> &Arc<Node> {
        &self.nodes[0].node
    }

    pub fn node(&self, index: usize) -> &Arc<Node> {
        &self.nodes[index].node
    }
}

/// Wait until the node reports the given election state.
pub async fn wait_for_state(node: &Node, state: ElectionState) {
    let mut rx = node.election().subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for election state")
        .unwrap();
}

//! Embedded, in-process coordination backend
//!
//! Emulates the ZooKeeper session model: every [`MemSession`] owns the
//! ephemeral nodes it created, and closing (or dropping) the session removes
//! them and fires the watches other sessions hold on them. Watches are
//! one-shot, like ZooKeeper's.

use super::{Coordination, CreateMode, EventKind, Watch, WatchedEvent};
use crate::common::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

type Waiter = (u64, oneshot::Sender<WatchedEvent>);

#[derive(Debug, Default)]
struct ZNode {
    data: Vec<u8>,
    /// Owning session for ephemeral nodes
    owner: Option<u64>,
    children: BTreeSet<String>,
    /// Next suffix for sequential children
    next_sequence: u64,
}

#[derive(Debug)]
struct Namespace {
    nodes: HashMap<String, ZNode>,
    data_watches: HashMap<String, Vec<Waiter>>,
    child_watches: HashMap<String, Vec<Waiter>>,
    next_session: u64,
    available: bool,
}

impl Namespace {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), ZNode::default());
        Self {
            nodes,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            next_session: 1,
            available: true,
        }
    }

    fn fire(watches: &mut HashMap<String, Vec<Waiter>>, path: &str, kind: EventKind) {
        if let Some(waiters) = watches.remove(path) {
            for (_, tx) in waiters {
                let _ = tx.send(WatchedEvent {
                    kind,
                    path: path.to_string(),
                });
            }
        }
    }

    fn remove_node(&mut self, path: &str) -> Result<()> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if !node.children.is_empty() {
            return Err(Error::Internal(format!("node has children: {}", path)));
        }
        self.nodes.remove(path);

        let (parent, name) = split_path(path)?;
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node.children.remove(name);
        }

        Self::fire(&mut self.data_watches, path, EventKind::NodeDeleted);
        Self::fire(&mut self.child_watches, path, EventKind::NodeDeleted);
        Self::fire(&mut self.child_watches, parent, EventKind::NodeChildrenChanged);
        Ok(())
    }

    fn close_session(&mut self, session: u64) {
        let mut owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        // deepest first; ephemeral nodes have no children, but keep it safe
        owned.sort_by_key(|path| std::cmp::Reverse(path.len()));
        for path in owned {
            let _ = self.remove_node(&path);
        }

        for watches in [&mut self.data_watches, &mut self.child_watches] {
            for waiters in watches.values_mut() {
                waiters.retain(|(owner, _)| *owner != session);
            }
            watches.retain(|_, waiters| !waiters.is_empty());
        }
    }
}

fn split_path(path: &str) -> Result<(&str, &str)> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
        return Err(Error::Internal(format!("invalid path: {:?}", path)));
    }
    let idx = path.rfind('/').unwrap_or(0);
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Ok((parent, &path[idx + 1..]))
}

/// Shared namespace; hand out one [`MemSession`] per node.
#[derive(Debug, Clone)]
pub struct MemCoordination {
    inner: Arc<Mutex<Namespace>>,
}

impl Default for MemCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCoordination {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Namespace::new())),
        }
    }

    /// Open a new client session.
    pub fn session(&self) -> MemSession {
        let id = {
            let mut ns = lock(&self.inner);
            let id = ns.next_session;
            ns.next_session += 1;
            id
        };
        MemSession {
            id,
            inner: self.inner.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate the service becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        lock(&self.inner).available = available;
    }
}

fn lock(inner: &Mutex<Namespace>) -> MutexGuard<'_, Namespace> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A client session on a [`MemCoordination`] namespace.
#[derive(Debug)]
pub struct MemSession {
    id: u64,
    inner: Arc<Mutex<Namespace>>,
    closed: AtomicBool,
}

impl MemSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// End the session: ephemeral nodes vanish and peers' watches fire.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.inner).close_session(self.id);
        tracing::debug!(session = self.id, "coordination session closed");
    }

    fn namespace(&self) -> Result<MutexGuard<'_, Namespace>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::CoordinationUnavailable(format!(
                "session {} is closed",
                self.id
            )));
        }
        let ns = lock(&self.inner);
        if !ns.available {
            return Err(Error::CoordinationUnavailable(
                "coordination service unreachable".into(),
            ));
        }
        Ok(ns)
    }
}

impl Drop for MemSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[tonic::async_trait]
impl Coordination for MemSession {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        let mut ns = self.namespace()?;
        let (parent, _) = split_path(path)?;

        let parent_node = ns
            .nodes
            .get_mut(parent)
            .ok_or_else(|| Error::NoNode(parent.to_string()))?;
        let actual = match mode {
            CreateMode::EphemeralSequential => {
                let seq = parent_node.next_sequence;
                parent_node.next_sequence += 1;
                format!("{}{:010}", path, seq)
            }
            CreateMode::Persistent | CreateMode::Ephemeral => path.to_string(),
        };
        if ns.nodes.contains_key(&actual) {
            return Err(Error::NodeExists(actual));
        }

        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential => Some(self.id),
        };
        ns.nodes.insert(
            actual.clone(),
            ZNode {
                data,
                owner,
                ..Default::default()
            },
        );
        let (parent, name) = split_path(&actual)?;
        if let Some(parent_node) = ns.nodes.get_mut(parent) {
            parent_node.children.insert(name.to_string());
        }
        Namespace::fire(&mut ns.child_watches, parent, EventKind::NodeChildrenChanged);
        Namespace::fire(&mut ns.data_watches, &actual, EventKind::NodeCreated);
        Ok(actual)
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let ns = self.namespace()?;
        ns.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, Watch)> {
        let mut ns = self.namespace()?;
        let data = ns
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        let (tx, watch) = Watch::pair(path);
        let waiters = ns.data_watches.entry(path.to_string()).or_default();
        waiters.retain(|(_, tx)| !tx.is_closed());
        waiters.push((self.id, tx));
        Ok((data, watch))
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let mut ns = self.namespace()?;
        let node = ns
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        node.data = data;
        Namespace::fire(&mut ns.data_watches, path, EventKind::NodeDataChanged);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut ns = self.namespace()?;
        ns.remove_node(path)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let ns = self.namespace()?;
        ns.nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let mut ns = self.namespace()?;
        let children: Vec<String> = ns
            .nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        let (tx, watch) = Watch::pair(path);
        let waiters = ns.child_watches.entry(path.to_string()).or_default();
        waiters.retain(|(_, tx)| !tx.is_closed());
        waiters.push((self.id, tx));
        Ok((children, watch))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let ns = self.namespace()?;
        Ok(ns.nodes.contains_key(path))
    }
}

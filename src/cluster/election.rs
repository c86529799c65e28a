//! Leader election over the coordination service
//!
//! Every process creates one ephemeral-sequential node under `/election`.
//! The live node with the smallest sequence number leads; every other node
//! follows and watches its immediate predecessor, so a crash wakes exactly
//! one successor instead of the whole cluster.
//!
//! ```text
//!  Electing ──smallest──▶ Leader   (stable until process exit)
//!     │
//!     └──otherwise──▶ Follower ──predecessor deleted / recheck timeout──▶ re-evaluate
//! ```

use crate::common::{Error, Result, METRICS};
use crate::coordination::{
    child_path, node_name, Coordination, CreateMode, EventKind, ELECTION_NODE_PREFIX,
    ELECTION_PATH, MASTER_PATH, WORKERS_PATH,
};
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionState {
    Electing,
    Leader,
    Follower,
}

impl ElectionState {
    pub fn role(&self) -> Option<Role> {
        match self {
            ElectionState::Electing => None,
            ElectionState::Leader => Some(Role::Leader),
            ElectionState::Follower => Some(Role::Follower),
        }
    }
}

/// Outcome of one evaluation of the election children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Leader,
    Follower { predecessor: String },
}

/// Sequence number embedded in an election node name (`node_0000000042` → 42).
pub fn sequence_of(name: &str) -> Option<u64> {
    name.rsplit('_').next()?.parse().ok()
}

/// Decide this node's role from the current election children.
///
/// Ordering is numeric on the sequence suffix, never on arrival order or the
/// raw name. Names without a parsable suffix are ignored.
pub fn decide(own: &str, siblings: &[String]) -> Result<Decision> {
    let mut ordered: Vec<(u64, &String)> = siblings
        .iter()
        .filter_map(|name| sequence_of(name).map(|seq| (seq, name)))
        .collect();
    ordered.sort_unstable_by_key(|(seq, _)| *seq);

    let position = ordered
        .iter()
        .position(|(_, name)| name.as_str() == own)
        .ok_or_else(|| {
            Error::CoordinationUnavailable(format!("election node {} no longer exists", own))
        })?;

    if position == 0 {
        Ok(Decision::Leader)
    } else {
        Ok(Decision::Follower {
            predecessor: ordered[position - 1].1.clone(),
        })
    }
}

pub struct ElectionEngine {
    coord: Arc<dyn Coordination>,
    /// Published under `/workers/<seq>` while following
    advertise_addr: String,
    recheck: Duration,
    state: watch::Sender<ElectionState>,
    node_path: OnceLock<String>,
}

impl ElectionEngine {
    pub fn new(coord: Arc<dyn Coordination>, advertise_addr: String, recheck: Duration) -> Self {
        let (state, _) = watch::channel(ElectionState::Electing);
        Self {
            coord,
            advertise_addr,
            recheck,
            state,
            node_path: OnceLock::new(),
        }
    }

    pub fn state(&self) -> ElectionState {
        *self.state.borrow()
    }

    pub fn role(&self) -> Option<Role> {
        self.state().role()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == ElectionState::Leader
    }

    pub fn subscribe(&self) -> watch::Receiver<ElectionState> {
        self.state.subscribe()
    }

    /// Full path of this process's election node, once created.
    pub fn node_path(&self) -> Option<&str> {
        self.node_path.get().map(String::as_str)
    }

    /// Join the election. Returns once a role is determined; the returned
    /// task keeps following (and may later promote) this node. An error from
    /// the task means the node can no longer know its role.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        let path = child_path(ELECTION_PATH, ELECTION_NODE_PREFIX);
        let created = self
            .coord
            .create(&path, Vec::new(), CreateMode::EphemeralSequential)
            .await?;
        tracing::info!(node = %created, "created election node");
        self.node_path
            .set(created.clone())
            .map_err(|_| Error::Internal("election already started".into()))?;

        let mut rx = self.subscribe();
        let engine = self.clone();
        let mut handle = tokio::spawn(async move { engine.run(created).await });

        tokio::select! {
            biased;
            determined = async { rx.wait_for(|state| *state != ElectionState::Electing).await.map(|_| ()) } => {
                determined.map_err(|_| Error::Internal("election state channel closed".into()))?;
                Ok(handle)
            }
            joined = &mut handle => match joined {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => Err(Error::Internal("election ended without a role".into())),
                Err(e) => Err(Error::Internal(format!("election task failed: {}", e))),
            },
        }
    }

    /// The election loop. Returns `Ok` once this node leads.
    async fn run(self: Arc<Self>, own_path: String) -> Result<()> {
        let own = node_name(&own_path).to_string();
        let suffix = own
            .strip_prefix(ELECTION_NODE_PREFIX)
            .unwrap_or(own.as_str())
            .to_string();

        loop {
            METRICS.elections.inc();
            let siblings = self.coord.children(ELECTION_PATH).await?;

            match decide(&own, &siblings)? {
                Decision::Leader => {
                    self.deregister_worker(&suffix).await?;
                    self.register_master(&suffix).await?;
                    self.state.send_replace(ElectionState::Leader);
                    METRICS.leaders.inc();
                    tracing::info!(node = %own, "this instance is the leader");
                    return Ok(());
                }
                Decision::Follower { predecessor } => {
                    self.register_worker(&suffix).await?;
                    let previous = self.state.send_replace(ElectionState::Follower);
                    if previous != ElectionState::Follower {
                        tracing::info!(node = %own, %predecessor, "this instance is a follower");
                    }

                    let predecessor_path = child_path(ELECTION_PATH, &predecessor);
                    let watch = match self.coord.get_watch(&predecessor_path).await {
                        Ok((_, watch)) => watch,
                        Err(Error::NoNode(_)) => {
                            tracing::debug!(%predecessor, "predecessor vanished before watch, rechecking");
                            continue;
                        }
                        Err(e) => return Err(e),
                    };

                    match tokio::time::timeout(self.recheck, watch.changed()).await {
                        Ok(event) if event.kind == EventKind::NodeDeleted => {
                            tracing::info!(%predecessor, "predecessor node deleted, rechecking election");
                        }
                        Ok(event) => {
                            tracing::debug!(kind = ?event.kind, "predecessor watch fired, rechecking election");
                        }
                        Err(_) => {
                            tracing::debug!("no election event within {:?}, rechecking", self.recheck);
                        }
                    }
                }
            }
        }
    }

    async fn register_worker(&self, suffix: &str) -> Result<()> {
        let path = child_path(WORKERS_PATH, suffix);
        if self.coord.exists(&path).await? {
            return Ok(());
        }
        match self
            .coord
            .create(&path, self.advertise_addr.as_bytes().to_vec(), CreateMode::Ephemeral)
            .await
        {
            Ok(_) | Err(Error::NodeExists(_)) => {
                tracing::info!(worker = %path, addr = %self.advertise_addr, "registered worker");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// A promoted follower must stop counting toward (and receiving) its own
    /// fan-out.
    async fn deregister_worker(&self, suffix: &str) -> Result<()> {
        let path = child_path(WORKERS_PATH, suffix);
        match self.coord.delete(&path).await {
            Ok(()) => {
                tracing::info!(worker = %path, "removed worker registration");
                Ok(())
            }
            Err(Error::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn register_master(&self, suffix: &str) -> Result<()> {
        let path = child_path(MASTER_PATH, suffix);
        if self.coord.exists(&path).await? {
            return Ok(());
        }
        match self
            .coord
            .create(&path, self.advertise_addr.as_bytes().to_vec(), CreateMode::Ephemeral)
            .await
        {
            Ok(_) | Err(Error::NodeExists(_)) => {
                tracing::info!(master = %path, "registered master");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

//! Two-phase quorum replication, leader side
//!
//! Phase 1 (`propose`) sends a pending entry to every registered follower and
//! succeeds once at least `write_quorum` of them acknowledged. Phase 2
//! (`commit`) broadcasts the commit best-effort. Calls to different followers
//! run in parallel and are joined before anything is counted; each call is
//! bounded by its own timeout and a timeout is just a missing ack.

use crate::cluster::MembershipTracker;
use crate::common::{Error, Result, METRICS};
use crate::coordination::{child_path, Coordination, WORKERS_PATH};
use crate::node::wal::WalEntry;
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Point-to-point replication calls to one follower.
#[tonic::async_trait]
pub trait PeerTransport: Send + Sync {
    /// Ask the follower to append the entry as pending.
    async fn replicate(&self, addr: &str, entry: &WalEntry) -> Result<()>;

    /// Ask the follower to mark the entry committed and apply it.
    async fn commit(&self, addr: &str, entry: &WalEntry) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Replicate,
    Commit,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Replicate => write!(f, "replicate"),
            Phase::Commit => write!(f, "commit"),
        }
    }
}

/// A registered follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    /// Name of the `/workers` child
    pub id: String,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerOutcome {
    pub peer: Peer,
    pub acked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposeOutcome {
    pub version: u64,
    pub acks: usize,
    pub quorum: usize,
    pub outcomes: Vec<PeerOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitOutcome {
    pub version: u64,
    pub acks: usize,
    pub outcomes: Vec<PeerOutcome>,
}

pub struct ReplicationCoordinator {
    coord: Arc<dyn Coordination>,
    membership: Arc<MembershipTracker>,
    transport: Arc<dyn PeerTransport>,
    peer_timeout: Duration,
}

impl ReplicationCoordinator {
    pub fn new(
        coord: Arc<dyn Coordination>,
        membership: Arc<MembershipTracker>,
        transport: Arc<dyn PeerTransport>,
        peer_timeout: Duration,
    ) -> Self {
        Self {
            coord,
            membership,
            transport,
            peer_timeout,
        }
    }

    /// Current followers and their addresses. A worker that disappears
    /// between listing and reading is skipped.
    pub async fn peers(&self) -> Result<Vec<Peer>> {
        let mut names = self.coord.children(WORKERS_PATH).await?;
        names.sort();

        let mut peers = Vec::with_capacity(names.len());
        for id in names {
            match self.coord.get(&child_path(WORKERS_PATH, &id)).await {
                Ok(data) => match String::from_utf8(data) {
                    Ok(addr) if !addr.is_empty() => peers.push(Peer { id, addr }),
                    _ => tracing::warn!(worker = %id, "worker has no usable address, skipping"),
                },
                Err(Error::NoNode(_)) => {
                    tracing::debug!(worker = %id, "worker left during listing");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(peers)
    }

    /// Phase 1. Fails with `QuorumNotReached` when fewer than the live write
    /// quorum acknowledged; the entry is then left pending.
    pub async fn propose(&self, entry: &WalEntry) -> Result<ProposeOutcome> {
        let peers = self.peers().await?;
        let outcomes = self.fan_out(Phase::Replicate, peers, entry).await;
        let acks = outcomes.iter().filter(|o| o.acked).count();

        // quorum is taken from the worker set as it is now, not at fan-out
        let snapshot = self.membership.refresh().await?;
        let quorum = snapshot.write_quorum;

        if acks >= quorum {
            tracing::debug!(version = entry.version, acks, quorum, "quorum reached");
            Ok(ProposeOutcome {
                version: entry.version,
                acks,
                quorum,
                outcomes,
            })
        } else {
            tracing::warn!(
                version = entry.version,
                acks,
                quorum,
                cluster_size = snapshot.cluster_size,
                "quorum not reached, entry left pending"
            );
            Err(Error::QuorumNotReached { acks, quorum })
        }
    }

    /// Phase 2. Best-effort; only a failure to list the followers is an error.
    pub async fn commit(&self, entry: &WalEntry) -> Result<CommitOutcome> {
        let peers = self.peers().await?;
        let outcomes = self.fan_out(Phase::Commit, peers, entry).await;
        let acks = outcomes.iter().filter(|o| o.acked).count();
        if acks < outcomes.len() {
            tracing::warn!(
                version = entry.version,
                acks,
                peers = outcomes.len(),
                "commit not acknowledged by every follower"
            );
        }
        Ok(CommitOutcome {
            version: entry.version,
            acks,
            outcomes,
        })
    }

    async fn fan_out(&self, phase: Phase, peers: Vec<Peer>, entry: &WalEntry) -> Vec<PeerOutcome> {
        let calls = peers.into_iter().map(|peer| async move {
            let call = async {
                match phase {
                    Phase::Replicate => self.transport.replicate(&peer.addr, entry).await,
                    Phase::Commit => self.transport.commit(&peer.addr, entry).await,
                }
            };

            let error = match tokio::time::timeout(self.peer_timeout, call).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("no response within {:?}", self.peer_timeout)),
            };

            if let Some(reason) = &error {
                METRICS.peer_failures.inc();
                let err = Error::PeerUnreachable {
                    peer: peer.addr.clone(),
                    reason: reason.clone(),
                };
                tracing::warn!(version = entry.version, %phase, worker = %peer.id, "{}", err);
            }

            PeerOutcome {
                peer,
                acked: error.is_none(),
                error,
            }
        });

        join_all(calls).await
    }
}

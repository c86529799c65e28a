//! Cluster membership tracking
//!
//! Watches the `/workers` registry and republishes the derived cluster size
//! and quorum thresholds. Readers always get a whole snapshot, old or new.

use crate::common::{Result, METRICS};
use crate::coordination::{Coordination, WORKERS_PATH};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Majority threshold: `floor(n / 2) + 1`.
pub fn quorum(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MembershipSnapshot {
    /// Registered followers
    pub cluster_size: usize,
    pub write_quorum: usize,
    pub read_quorum: usize,
}

impl MembershipSnapshot {
    pub fn from_size(cluster_size: usize) -> Self {
        Self {
            cluster_size,
            write_quorum: quorum(cluster_size),
            read_quorum: quorum(cluster_size),
        }
    }
}

pub struct MembershipTracker {
    coord: Arc<dyn Coordination>,
    retry: Duration,
    snapshot: watch::Sender<MembershipSnapshot>,
}

impl MembershipTracker {
    pub fn new(coord: Arc<dyn Coordination>, retry: Duration) -> Self {
        let (snapshot, _) = watch::channel(MembershipSnapshot::from_size(0));
        Self {
            coord,
            retry,
            snapshot,
        }
    }

    /// Current snapshot. May be stale by the time the caller uses it.
    pub fn snapshot(&self) -> MembershipSnapshot {
        *self.snapshot.borrow()
    }

    /// Receiver that observes every republished snapshot.
    pub fn subscribe(&self) -> watch::Receiver<MembershipSnapshot> {
        self.snapshot.subscribe()
    }

    /// Re-read the worker set and publish a fresh snapshot.
    pub async fn refresh(&self) -> Result<MembershipSnapshot> {
        let workers = self.coord.children(WORKERS_PATH).await?;
        Ok(self.publish(workers.len()))
    }

    fn publish(&self, cluster_size: usize) -> MembershipSnapshot {
        let snapshot = MembershipSnapshot::from_size(cluster_size);
        self.snapshot.send_replace(snapshot);
        METRICS.membership_refreshes.inc();
        METRICS.cluster_size.set(cluster_size as u64);
        snapshot
    }

    /// Initial refresh; failure here is fatal to startup.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let snapshot = self.refresh().await?;
        tracing::info!(
            cluster_size = snapshot.cluster_size,
            write_quorum = snapshot.write_quorum,
            "membership initialized"
        );
        Ok(self.clone().spawn_watch())
    }

    /// Follow `/workers` for the lifetime of the process. Read failures are
    /// logged and retried; they never end the loop.
    pub fn spawn_watch(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.coord.children_watch(WORKERS_PATH).await {
                    Ok((workers, watch)) => {
                        let previous = self.snapshot();
                        let snapshot = self.publish(workers.len());
                        if snapshot != previous {
                            tracing::info!(
                                cluster_size = snapshot.cluster_size,
                                write_quorum = snapshot.write_quorum,
                                "cluster size changed"
                            );
                        }
                        let event = watch.changed().await;
                        tracing::debug!(kind = ?event.kind, "worker set watch fired");
                    }
                    Err(e) => {
                        tracing::warn!("membership refresh failed, retrying in {:?}: {}", self.retry, e);
                        tokio::time::sleep(self.retry).await;
                    }
                }
            }
        })
    }
}

//! ZooKeeper coordination backend
//!
//! One [`ZkCoordination`] is one ZooKeeper session. Ephemeral nodes live as
//! long as the session, so a crashed process drops out of `/election` and
//! `/workers` once its session expires on the ensemble.

use super::{Coordination, CreateMode, EventKind, Watch, WatchedEvent};
use crate::common::{Error, Result};
use std::time::Duration;
use zookeeper_client as zk;

pub struct ZkCoordination {
    client: zk::Client,
    hosts: String,
}

impl ZkCoordination {
    /// Connect to an ensemble, e.g. `zk1:2181,zk2:2181`.
    pub async fn connect(hosts: &str, timeout: Duration) -> Result<Self> {
        let client = tokio::time::timeout(timeout, zk::Client::connect(hosts))
            .await
            .map_err(|_| {
                Error::CoordinationUnavailable(format!(
                    "no ZooKeeper session with {} within {:?}",
                    hosts, timeout
                ))
            })?
            .map_err(|e| Error::CoordinationUnavailable(format!("{}: {}", hosts, e)))?;
        tracing::info!(hosts, "ZooKeeper session established");
        Ok(Self {
            client,
            hosts: hosts.to_string(),
        })
    }

    pub fn hosts(&self) -> &str {
        &self.hosts
    }
}

fn map_error(path: &str, err: zk::Error) -> Error {
    match err {
        zk::Error::NoNode => Error::NoNode(path.to_string()),
        zk::Error::NodeExists => Error::NodeExists(path.to_string()),
        other => Error::CoordinationUnavailable(format!("{}: {}", path, other)),
    }
}

fn event_kind(event_type: zk::EventType) -> EventKind {
    match event_type {
        zk::EventType::NodeCreated => EventKind::NodeCreated,
        zk::EventType::NodeDeleted => EventKind::NodeDeleted,
        zk::EventType::NodeDataChanged => EventKind::NodeDataChanged,
        zk::EventType::NodeChildrenChanged => EventKind::NodeChildrenChanged,
        // session events: the watch will never fire for the node
        _ => EventKind::SessionClosed,
    }
}

fn create_options(mode: CreateMode) -> zk::CreateOptions<'static> {
    let mode = match mode {
        CreateMode::Persistent => zk::CreateMode::Persistent,
        CreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        CreateMode::EphemeralSequential => zk::CreateMode::EphemeralSequential,
    };
    mode.with_acls(zk::Acls::anyone_all())
}

/// Bridge a ZooKeeper one-shot watcher onto a [`Watch`].
fn bridge(path: &str, watcher: zk::OneshotWatcher) -> Watch {
    let (tx, watch) = Watch::pair(path);
    tokio::spawn(async move {
        let event = watcher.changed().await;
        let _ = tx.send(WatchedEvent {
            kind: event_kind(event.event_type),
            path: event.path,
        });
    });
    watch
}

#[tonic::async_trait]
impl Coordination for ZkCoordination {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        let (_, sequence) = self
            .client
            .create(path, &data, &create_options(mode))
            .await
            .map_err(|e| map_error(path, e))?;
        Ok(match mode {
            CreateMode::EphemeralSequential => format!("{}{}", path, sequence),
            CreateMode::Persistent | CreateMode::Ephemeral => path.to_string(),
        })
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let (data, _) = self
            .client
            .get_data(path)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok(data)
    }

    async fn get_watch(&self, path: &str) -> Result<(Vec<u8>, Watch)> {
        let (data, _, watcher) = self
            .client
            .get_and_watch_data(path)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok((data, bridge(path, watcher)))
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.client
            .set_data(path, &data, None)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client
            .delete(path, None)
            .await
            .map_err(|e| map_error(path, e))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.client
            .list_children(path)
            .await
            .map_err(|e| map_error(path, e))
    }

    async fn children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let (children, watcher) = self
            .client
            .list_and_watch_children(path)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok((children, bridge(path, watcher)))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let stat = self
            .client
            .check_stat(path)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok(stat.is_some())
    }
}

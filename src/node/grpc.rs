//! Peer replication gRPC service (follower side)

use crate::node::wal::{Operation, WalEntry};
use crate::node::Node;
use crate::proto::peer_replication_server::{PeerReplication, PeerReplicationServer};
use crate::proto::{Ack, EntryMessage, OperationKind};
use std::sync::Arc;
use tonic::{Request, Response, Status};

impl From<&WalEntry> for EntryMessage {
    fn from(entry: &WalEntry) -> Self {
        let operation = match entry.operation {
            Operation::Put => OperationKind::Put,
            Operation::Delete => OperationKind::Delete,
        };
        EntryMessage {
            version: entry.version,
            operation: operation as i32,
            key: entry.key.clone(),
            value: entry.value.clone(),
        }
    }
}

impl From<EntryMessage> for WalEntry {
    fn from(msg: EntryMessage) -> Self {
        let operation = match msg.operation() {
            OperationKind::Put => Operation::Put,
            OperationKind::Delete => Operation::Delete,
        };
        WalEntry {
            version: msg.version,
            operation,
            key: msg.key,
            value: msg.value,
            committed: false,
        }
    }
}

pub struct PeerService {
    node: Arc<Node>,
}

impl PeerService {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    pub fn into_server(self) -> PeerReplicationServer<Self> {
        PeerReplicationServer::new(self)
    }
}

#[tonic::async_trait]
impl PeerReplication for PeerService {
    /// Append a leader's entry as pending.
    async fn replicate(&self, req: Request<EntryMessage>) -> Result<Response<Ack>, Status> {
        let entry = WalEntry::from(req.into_inner());
        let version = entry.version;
        let applied = self
            .node
            .handle_replicate(entry)
            .await
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(Ack { version, applied }))
    }

    /// Mark committed and apply to the local store.
    async fn commit(&self, req: Request<EntryMessage>) -> Result<Response<Ack>, Status> {
        let entry = WalEntry::from(req.into_inner());
        let version = entry.version;
        let applied = self
            .node
            .handle_commit(entry)
            .await
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(Ack { version, applied }))
    }
}

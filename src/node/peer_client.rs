//! gRPC implementation of [`PeerTransport`]

use crate::common::{Error, Result};
use crate::node::replication::PeerTransport;
use crate::node::wal::WalEntry;
use crate::proto::peer_replication_client::PeerReplicationClient;
use crate::proto::EntryMessage;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

/// Keeps one lazily connected channel per follower address. A failed call
/// drops the address's channel, so departed followers do not accumulate and
/// the next call reconnects.
pub struct GrpcPeerTransport {
    timeout: Duration,
    channels: Mutex<HashMap<String, Channel>>,
}

impl GrpcPeerTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, addr: &str) -> Result<PeerReplicationClient<Channel>> {
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(channel) = channels.get(addr) {
            return Ok(PeerReplicationClient::new(channel.clone()));
        }

        let uri = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        let channel = Endpoint::from_shared(uri)
            .map_err(|e| Error::PeerUnreachable {
                peer: addr.to_string(),
                reason: e.to_string(),
            })?
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .connect_lazy();
        channels.insert(addr.to_string(), channel.clone());
        Ok(PeerReplicationClient::new(channel))
    }

    fn evict(&self, addr: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        if channels.remove(addr).is_some() {
            tracing::debug!(peer = %addr, "dropped cached channel");
        }
    }

    /// Unwrap a response, evicting the channel when the call failed.
    fn ack<T>(
        &self,
        addr: &str,
        response: std::result::Result<tonic::Response<T>, tonic::Status>,
    ) -> Result<T> {
        match response {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                self.evict(addr);
                Err(status.into())
            }
        }
    }

    fn check_ack(addr: &str, expected: u64, acked: u64) -> Result<()> {
        if acked != expected {
            return Err(Error::PeerUnreachable {
                peer: addr.to_string(),
                reason: format!("acknowledged version {} instead of {}", acked, expected),
            });
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl PeerTransport for GrpcPeerTransport {
    async fn replicate(&self, addr: &str, entry: &WalEntry) -> Result<()> {
        let mut client = self.client(addr)?;
        let response = client
            .replicate(tonic::Request::new(EntryMessage::from(entry)))
            .await;
        let ack = self.ack(addr, response)?;
        Self::check_ack(addr, entry.version, ack.version)
    }

    async fn commit(&self, addr: &str, entry: &WalEntry) -> Result<()> {
        let mut client = self.client(addr)?;
        let response = client
            .commit(tonic::Request::new(EntryMessage::from(entry)))
            .await;
        let ack = self.ack(addr, response)?;
        Self::check_ack(addr, entry.version, ack.version)
    }
}

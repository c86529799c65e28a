//! Node server

use crate::common::{Error, NodeConfig, Result};
use crate::coordination::Coordination;
use crate::node::grpc::PeerService;
use crate::node::http::create_router;
use crate::node::{Node, NodeTasks, PeerTransport};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

/// A node with its listeners bound but not yet serving.
pub struct NodeServer {
    node: Arc<Node>,
    http_listener: TcpListener,
    grpc_listener: TcpListener,
}

impl NodeServer {
    /// Bind both listeners, then build the node. When no advertise address
    /// is configured, followers publish the gRPC address actually bound.
    pub async fn bind(
        mut config: NodeConfig,
        coord: Arc<dyn Coordination>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self> {
        let http_listener = TcpListener::bind(config.http_addr).await?;
        let grpc_listener = TcpListener::bind(config.grpc_addr).await?;

        config.http_addr = http_listener.local_addr()?;
        config.grpc_addr = grpc_listener.local_addr()?;

        let node = Arc::new(Node::new(config, coord, transport)?);
        Ok(Self {
            node,
            http_listener,
            grpc_listener,
        })
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.node.config().http_addr
    }

    pub fn grpc_addr(&self) -> SocketAddr {
        self.node.config().grpc_addr
    }

    /// Join the cluster and serve until a server fails or the election task
    /// ends with an error.
    pub async fn serve(self) -> Result<()> {
        let node = self.node;
        let config = node.config().clone();
        tracing::info!("Starting node: {}", config.node_id);
        tracing::info!("  HTTP API: {}", config.http_addr);
        tracing::info!("  gRPC API: {}", config.grpc_addr);
        tracing::info!("  Advertise: {}", config.advertise());
        tracing::info!("  WAL path: {}", config.wal_path().display());

        let grpc_server = tonic::transport::Server::builder()
            .add_service(PeerService::new(node.clone()).into_server())
            .serve_with_incoming(TcpListenerStream::new(self.grpc_listener));
        let mut grpc_handle = tokio::spawn(grpc_server);

        let NodeTasks {
            election: election_task,
            membership,
        } = match node.start().await {
            Ok(tasks) => tasks,
            Err(e) => {
                grpc_handle.abort();
                return Err(e);
            }
        };

        let http_server =
            axum::serve(self.http_listener, create_router(node.clone())).into_future();

        if let Some(role) = node.role() {
            tracing::info!("✓ Node {} ready ({})", config.node_id, role);
        }

        let election = async move {
            match election_task.await {
                // leadership is final; keep serving
                Ok(Ok(())) => std::future::pending::<Error>().await,
                Ok(Err(e)) => e,
                Err(e) => Error::Internal(format!("election task failed: {}", e)),
            }
        };

        let result = tokio::select! {
            res = http_server => {
                res.map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))
            }
            res = &mut grpc_handle => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Error::Internal(format!("gRPC server error: {}", e))),
                Err(e) => Err(Error::Internal(format!("gRPC server task failed: {}", e))),
            },
            e = election => {
                tracing::error!("election failed, node cannot know its role: {}", e);
                Err(e)
            }
        };

        grpc_handle.abort();
        membership.abort();
        result
    }
}

//! Node binary

use clap::{Parser, Subcommand};
use quorumkv::cluster::ElectionState;
use quorumkv::node::GrpcPeerTransport;
use quorumkv::{Config, MemCoordination, Node, NodeServer, ZkCoordination};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "quorumkv-node")]
#[command(about = "quorumkv replicated key-value node")]
#[command(version)]
struct Cli {
    /// Config file (TOML); QUORUMKV_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one node in this process against a ZooKeeper ensemble
    Serve {
        /// ZooKeeper hosts, e.g. zk1:2181,zk2:2181
        #[arg(long)]
        zk: Option<String>,

        /// Node ID, also names the WAL file (default: node-<grpc port>)
        #[arg(long)]
        id: Option<String>,

        /// Host to bind
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        http_port: Option<u16>,

        #[arg(long)]
        grpc_port: Option<u16>,

        /// Address published to the leader (default: host:grpc_port)
        #[arg(long)]
        advertise: Option<String>,

        /// WAL directory
        #[arg(long)]
        data: Option<PathBuf>,

        /// Per-call replication timeout
        #[arg(long)]
        peer_timeout_ms: Option<u64>,
    },

    /// Run a local cluster in this process, sharing an embedded
    /// coordination service
    Cluster {
        /// Number of nodes
        #[arg(long)]
        nodes: Option<usize>,

        /// Host to bind and advertise
        #[arg(long)]
        host: Option<String>,

        /// First HTTP port (node i uses port + i)
        #[arg(long)]
        http_port: Option<u16>,

        /// First gRPC port (node i uses port + i)
        #[arg(long)]
        grpc_port: Option<u16>,

        /// WAL directory
        #[arg(long)]
        data: Option<PathBuf>,

        /// Per-call replication timeout
        #[arg(long)]
        peer_timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("quorumkv-node {}", quorumkv::BUILD_INFO);

    match cli.command {
        Commands::Serve {
            zk,
            id,
            host,
            http_port,
            grpc_port,
            advertise,
            data,
            peer_timeout_ms,
        } => {
            if let Some(zk) = zk {
                config.zk_hosts = zk;
            }
            if id.is_some() {
                config.node_id = id;
            }
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = http_port {
                config.base_http_port = port;
            }
            if let Some(port) = grpc_port {
                config.base_grpc_port = port;
            }
            if advertise.is_some() {
                config.advertise_addr = advertise;
            }
            if let Some(data) = data {
                config.data_dir = data;
            }
            if let Some(ms) = peer_timeout_ms {
                config.peer_timeout_ms = ms;
            }
            config.validate()?;

            run_node(config).await?;
        }
        Commands::Cluster {
            nodes,
            host,
            http_port,
            grpc_port,
            data,
            peer_timeout_ms,
        } => {
            // CLI has priority over file and environment
            if let Some(nodes) = nodes {
                config.nodes = nodes;
            }
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = http_port {
                config.base_http_port = port;
            }
            if let Some(port) = grpc_port {
                config.base_grpc_port = port;
            }
            if let Some(data) = data {
                config.data_dir = data;
            }
            if let Some(ms) = peer_timeout_ms {
                config.peer_timeout_ms = ms;
            }
            config.validate()?;

            run_cluster(config).await?;
        }
    }

    Ok(())
}

async fn run_node(config: Config) -> anyhow::Result<()> {
    let node_config = config.standalone()?;
    tracing::info!(
        "Starting node {} against ZooKeeper {}",
        node_config.node_id,
        config.zk_hosts
    );

    let coord = Arc::new(ZkCoordination::connect(&config.zk_hosts, config.zk_timeout()).await?);
    let transport = Arc::new(GrpcPeerTransport::new(node_config.peer_timeout()));
    let server = NodeServer::bind(node_config, coord, transport).await?;
    let node = server.node().clone();

    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                tracing::error!("node {} failed: {}", node.node_id(), e);
                sync_wal(&node).await;
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    sync_wal(&node).await;
    Ok(())
}

/// Push out whatever the WAL sync policy left buffered.
async fn sync_wal(node: &Node) {
    if let Err(e) = node.wal().sync().await {
        tracing::warn!("WAL sync of {} failed: {}", node.node_id(), e);
    }
}

async fn run_cluster(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        "Starting local cluster: {} nodes, data in {}",
        config.nodes,
        config.data_dir.display()
    );

    let ensemble = MemCoordination::new();
    let mut servers = JoinSet::new();
    let mut nodes = Vec::with_capacity(config.nodes);

    // start nodes one at a time so the election order follows node order
    for index in 0..config.nodes {
        let node_config = config.node(index)?;
        let transport = Arc::new(GrpcPeerTransport::new(node_config.peer_timeout()));
        let server =
            NodeServer::bind(node_config, Arc::new(ensemble.session()), transport).await?;
        let node = server.node().clone();
        nodes.push(node.clone());
        let mut state = node.election().subscribe();

        servers.spawn(async move { (node.node_id().to_string(), server.serve().await) });

        tokio::select! {
            _ = state.wait_for(|s| *s != ElectionState::Electing) => {}
            Some(joined) = servers.join_next() => {
                let (id, result) = joined?;
                anyhow::bail!("node {} stopped during startup: {:?}", id, result.err());
            }
        }
    }

    tracing::info!("✓ Cluster ready, press Ctrl-C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
        Some(joined) = servers.join_next() => {
            let (id, result) = joined?;
            match result {
                Ok(()) => tracing::warn!("node {} stopped", id),
                Err(e) => {
                    tracing::error!("node {} failed: {}", id, e);
                    return Err(e.into());
                }
            }
        }
    }

    servers.shutdown().await;
    for node in &nodes {
        sync_wal(node).await;
    }
    Ok(())
}

//! # quorumkv
//!
//! A replicated key-value store with a single leader:
//! - Leader election over a ZooKeeper-style coordination service
//! - Membership and quorum tracking from the registered followers
//! - Write-ahead log (WAL) with version-conflict detection
//! - Two-phase quorum replication over gRPC, HTTP for the public API
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!              ┌──────────────────────────────┐
//!              │  Coordination service        │
//!              │  /election /workers          │
//!              │  /master   /version          │
//!              └──────▲───────────────▲───────┘
//!                     │ election,     │ worker set,
//!                     │ /version      │ watches
//!   ┌─────────────────┴──┐        ┌───┴────────────────┐
//!   │ Leader             │ gRPC   │ Follower (xN)      │
//!   │  WAL ─▶ propose ───┼───────▶│  WAL (pending)     │
//!   │      ─▶ commit  ───┼───────▶│  WAL (committed)   │
//!   │  store             │        │  store ◀── reads   │
//!   └────────────────────┘        └────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Run one node per process against ZooKeeper
//! ```bash
//! quorumkv-node serve --zk 127.0.0.1:2181 --http-port 8081 --grpc-port 9081
//! quorumkv-node serve --zk 127.0.0.1:2181 --http-port 8082 --grpc-port 9082
//! quorumkv-node serve --zk 127.0.0.1:2181 --http-port 8083 --grpc-port 9083
//! ```
//!
//! ### Start a local cluster in one process
//! ```bash
//! quorumkv-node cluster --nodes 3 --data ./qkv-data
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Write through the leader
//! quorumkv --node http://localhost:8081 put my-key my-value
//!
//! # Read from a follower
//! quorumkv --node http://localhost:8082 get my-key
//!
//! # Delete, inspect
//! quorumkv --node http://localhost:8081 delete my-key
//! quorumkv --node http://localhost:8082 status
//! ```

pub mod cluster;
pub mod common;
pub mod coordination;
pub mod node;

// Re-export commonly used types
pub use cluster::{ElectionEngine, MembershipTracker, Role};
pub use common::{Config, Error, NodeConfig, Result};
pub use coordination::{Coordination, MemCoordination, ZkCoordination};
pub use node::{Node, NodeServer, WalManager};

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("quorumkv");
}

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");

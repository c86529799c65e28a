//! Common utilities and types shared across quorumkv

pub mod config;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod utils;

pub use config::{Config, NodeConfig, WalSyncPolicy};
pub use error::{Error, Result};
pub use metrics::METRICS;
pub use storage::{KVStore, MemStore};
pub use utils::{crc32, encode_key, validate_key};

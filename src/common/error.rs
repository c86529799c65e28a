//! Error types for quorumkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === WAL Errors ===
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("WAL encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Version conflict: local WAL is at {local}, cluster commit pointer is at {cluster}")]
    VersionConflict { local: u64, cluster: u64 },

    // === Coordination Errors ===
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Coordination node already exists: {0}")]
    NodeExists(String),

    #[error("Coordination node does not exist: {0}")]
    NoNode(String),

    // === Replication Errors ===
    #[error("Quorum not reached: {acks} acknowledgments, {quorum} required")]
    QuorumNotReached { acks: usize, quorum: usize },

    #[error("Peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("Role violation: {0}")]
    RoleViolation(String),

    // === Network Errors ===
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// `VersionConflict` never is: this node's leadership may be stale.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QuorumNotReached { .. }
                | Error::PeerUnreachable { .. }
                | Error::CoordinationUnavailable(_)
                | Error::Io(_)
                | Error::Transport(_)
        )
    }

    /// Short machine-readable name, returned to HTTP clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) | Error::Wal(_) | Error::Encoding(_) => "wal_io",
            Error::VersionConflict { .. } => "version_conflict",
            Error::CoordinationUnavailable(_) | Error::NodeExists(_) | Error::NoNode(_) => {
                "coordination_unavailable"
            }
            Error::QuorumNotReached { .. } => "quorum_not_reached",
            Error::PeerUnreachable { .. } | Error::Grpc(_) | Error::Transport(_) => {
                "peer_unreachable"
            }
            Error::RoleViolation(_) => "role_violation",
            Error::InvalidKey(_) | Error::Json(_) => "invalid_request",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Internal(_) => "internal",
        }
    }

    /// Convert to gRPC status for RPC responses
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        match self {
            Error::RoleViolation(_) => tonic::Status::new(Code::FailedPrecondition, self.to_string()),
            Error::VersionConflict { .. } => tonic::Status::new(Code::Aborted, self.to_string()),
            Error::InvalidKey(_) => tonic::Status::new(Code::InvalidArgument, self.to_string()),
            Error::CoordinationUnavailable(_) => {
                tonic::Status::new(Code::Unavailable, self.to_string())
            }
            Error::Grpc(status) => status.clone(),
            _ => tonic::Status::new(Code::Internal, self.to_string()),
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::RoleViolation(_) => StatusCode::FORBIDDEN,
            Error::VersionConflict { .. } => StatusCode::CONFLICT,
            Error::QuorumNotReached { .. } | Error::CoordinationUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::PeerUnreachable { .. } | Error::Grpc(_) | Error::Transport(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::InvalidKey(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

//! Error types for the cluster layer.

use storage::StorageError;
use streaming::StreamingError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Core(#[from] corelib::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Streaming(#[from] StreamingError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrong status, malformed reply or dropped connection on an admin call
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A command that is not valid in the node's current state
    #[error("rejected: {0}")]
    Rejected(String),
    /// Ring ranges no longer tile the space, or a member has no metadata
    #[error("ring invariant violated: {0}")]
    Invariant(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to launch {node}: {reason}")]
    Launch { node: String, reason: String },
    #[error("no idle nodes available")]
    NoIdleNodes,
    #[error("the ring has no members")]
    EmptyRing,
    #[error("unknown node {0}")]
    UnknownNode(String),
    /// Data moved, but some follow-up step failed; the ring reflects the move.
    #[error("rebalance incomplete: {0}")]
    Incomplete(String),
    #[error("server stopped")]
    ServerStopped,
    #[error("server write-locked")]
    WriteLocked,
}

impl ClusterError {
    /// Invariant violations are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::Invariant(_) | ClusterError::Core(corelib::Error::Invariant(_))
        )
    }
}

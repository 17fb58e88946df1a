//! Error types for the core library.

use thiserror::Error;

/// Result type alias for the core library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the core library.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Invalid hash key text or bytes
    #[error("Invalid hash key: {0}")]
    InvalidHashKey(String),
    /// Invalid node configuration
    #[error("Invalid node: {0}")]
    InvalidNode(String),
    /// Ring operation failed
    #[error("Ring operation failed: {0}")]
    RingOperation(String),
    /// Ring ranges no longer tile the hash space; never retried
    #[error("Ring invariant violated: {0}")]
    Invariant(String),
}

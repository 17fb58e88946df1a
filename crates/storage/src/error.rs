//! Error types for record storage.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// A file in the record tree whose name is not a hash key
    #[error("not a record file: {0}")]
    NotARecord(String),
    #[error("unknown cache strategy: {0}")]
    UnknownStrategy(String),
}

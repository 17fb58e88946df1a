//! Error types for the wire protocol and data transfer.

use crate::protocol::MessageType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamingError>;

#[derive(Debug, Error)]
pub enum StreamingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("expected {expected:?}, got {got:?}")]
    UnexpectedMessage {
        expected: MessageType,
        got: MessageType,
    },
    #[error("timed out waiting for peer")]
    Timeout,
    #[error("transfer aborted: {0}")]
    Transfer(String),
}

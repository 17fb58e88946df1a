//! Wire protocol and range-indexed data transfer.
//!
//! This crate provides:
//! - The message set shared by clients, nodes and the orchestrator
//! - The framing codec and fixed-layout metadata encoding
//! - Enumeration of on-disk records by key hash range
//! - Streaming those records to another node during rebalancing

pub mod codec;
pub mod error;
pub mod index;
pub mod protocol;
pub mod sender;

pub use codec::{read_message, write_message};
pub use error::{Result, StreamingError};
pub use index::{RangeIndex, RangeIndexer};
pub use protocol::{Message, MessageType};
pub use sender::{transfer_range, RangeSender, TransferReport};

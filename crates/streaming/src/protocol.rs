//! Message set exchanged between clients, nodes and the orchestrator.
//!
//! Every message is one tag byte (`MessageType`) and an optional payload.
//! Requests and their replies:
//!
//! | request | success reply |
//! |---|---|
//! | `Get` | `GetSuccess` / `GetError` |
//! | `Put` | `PutSuccess` / `PutUpdate` / `PutError` |
//! | `Delete` | `DeleteSuccess` / `DeleteError` |
//! | `TransferPut` | `TransferPutSuccess` |
//! | `Init` .. `Shutdown` | the matching `…Success`, else `AdminError` |
//! | `ServerFailed` | `ReportReceived` |
//!
//! Any client request may also be answered with `ServerStopped`,
//! `ServerWriteLock` or `ServerNotResponsible`.

use corelib::{HashKey, KeyHashRange, Metadata, NodeInfo};
use std::net::SocketAddrV4;
use storage::CacheStrategy;

use crate::error::StreamingError;

macro_rules! message_types {
    ($($name:ident = $tag:literal),* $(,)?) => {
        /// Tag byte identifying a message on the wire.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum MessageType {
            $($name = $tag),*
        }

        impl TryFrom<u8> for MessageType {
            type Error = StreamingError;

            fn try_from(tag: u8) -> Result<Self, Self::Error> {
                match tag {
                    $($tag => Ok(MessageType::$name),)*
                    other => Err(StreamingError::UnknownMessageType(other)),
                }
            }
        }
    };
}

message_types! {
    // Client requests
    Get = 0x01,
    Put = 0x02,
    Delete = 0x03,
    TransferPut = 0x04,
    // Client replies
    GetSuccess = 0x10,
    GetError = 0x11,
    PutSuccess = 0x12,
    PutUpdate = 0x13,
    PutError = 0x14,
    DeleteSuccess = 0x15,
    DeleteError = 0x16,
    TransferPutSuccess = 0x17,
    TransferPutError = 0x18,
    ServerStopped = 0x19,
    ServerWriteLock = 0x1a,
    ServerNotResponsible = 0x1b,
    // Admin commands
    Init = 0x20,
    Start = 0x21,
    Stop = 0x22,
    LockWrite = 0x23,
    UnlockWrite = 0x24,
    MoveData = 0x25,
    UpdateMetadata = 0x26,
    Shutdown = 0x27,
    // Admin replies
    InitSuccess = 0x30,
    StartSuccess = 0x31,
    StopSuccess = 0x32,
    LockWriteSuccess = 0x33,
    UnlockWriteSuccess = 0x34,
    MoveDataSuccess = 0x35,
    UpdateMetadataSuccess = 0x36,
    ShutdownSuccess = 0x37,
    AdminError = 0x3f,
    // Failure side-channel
    ServerFailed = 0x40,
    ReportReceived = 0x41,
    Heartbeat = 0x50,
}

impl MessageType {
    /// The one status that acknowledges this admin command.
    pub fn success_status(self) -> Option<MessageType> {
        use MessageType::*;
        match self {
            Init => Some(InitSuccess),
            Start => Some(StartSuccess),
            Stop => Some(StopSuccess),
            LockWrite => Some(LockWriteSuccess),
            UnlockWrite => Some(UnlockWriteSuccess),
            MoveData => Some(MoveDataSuccess),
            UpdateMetadata => Some(UpdateMetadataSuccess),
            Shutdown => Some(ShutdownSuccess),
            TransferPut => Some(TransferPutSuccess),
            ServerFailed => Some(ReportReceived),
            _ => None,
        }
    }

    pub fn is_admin_command(self) -> bool {
        (MessageType::Init as u8..=MessageType::Shutdown as u8).contains(&(self as u8))
    }
}

/// A decoded message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Get { key: String },
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
    /// Record pushed by another node while migrating a range; accepted even
    /// under a write lock.
    TransferPut { hash: HashKey, value: Vec<u8> },

    GetSuccess { key: String, value: Vec<u8> },
    GetError { key: String },
    PutSuccess { key: String },
    PutUpdate { key: String },
    PutError { key: String },
    DeleteSuccess { key: String },
    DeleteError { key: String },
    TransferPutSuccess,
    TransferPutError,
    ServerStopped,
    ServerWriteLock,
    ServerNotResponsible { metadata: Metadata },

    Init {
        cache_size: u32,
        strategy: CacheStrategy,
        /// Where to send failure reports.
        report_addr: SocketAddrV4,
        metadata: Metadata,
    },
    Start,
    Stop,
    LockWrite,
    UnlockWrite,
    MoveData { range: KeyHashRange, target: NodeInfo },
    UpdateMetadata { metadata: Metadata },
    Shutdown,

    InitSuccess,
    StartSuccess,
    StopSuccess,
    LockWriteSuccess,
    UnlockWriteSuccess,
    MoveDataSuccess,
    UpdateMetadataSuccess,
    ShutdownSuccess,
    AdminError { reason: String },

    ServerFailed { range: KeyHashRange },
    ReportReceived,

    /// Liveness datagram from the ring predecessor.
    Heartbeat { sender: HashKey },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        use Message as M;
        use MessageType as T;
        match self {
            M::Get { .. } => T::Get,
            M::Put { .. } => T::Put,
            M::Delete { .. } => T::Delete,
            M::TransferPut { .. } => T::TransferPut,
            M::GetSuccess { .. } => T::GetSuccess,
            M::GetError { .. } => T::GetError,
            M::PutSuccess { .. } => T::PutSuccess,
            M::PutUpdate { .. } => T::PutUpdate,
            M::PutError { .. } => T::PutError,
            M::DeleteSuccess { .. } => T::DeleteSuccess,
            M::DeleteError { .. } => T::DeleteError,
            M::TransferPutSuccess => T::TransferPutSuccess,
            M::TransferPutError => T::TransferPutError,
            M::ServerStopped => T::ServerStopped,
            M::ServerWriteLock => T::ServerWriteLock,
            M::ServerNotResponsible { .. } => T::ServerNotResponsible,
            M::Init { .. } => T::Init,
            M::Start => T::Start,
            M::Stop => T::Stop,
            M::LockWrite => T::LockWrite,
            M::UnlockWrite => T::UnlockWrite,
            M::MoveData { .. } => T::MoveData,
            M::UpdateMetadata { .. } => T::UpdateMetadata,
            M::Shutdown => T::Shutdown,
            M::InitSuccess => T::InitSuccess,
            M::StartSuccess => T::StartSuccess,
            M::StopSuccess => T::StopSuccess,
            M::LockWriteSuccess => T::LockWriteSuccess,
            M::UnlockWriteSuccess => T::UnlockWriteSuccess,
            M::MoveDataSuccess => T::MoveDataSuccess,
            M::UpdateMetadataSuccess => T::UpdateMetadataSuccess,
            M::ShutdownSuccess => T::ShutdownSuccess,
            M::AdminError { .. } => T::AdminError,
            M::ServerFailed { .. } => T::ServerFailed,
            M::ReportReceived => T::ReportReceived,
            M::Heartbeat { .. } => T::Heartbeat,
        }
    }

    /// Payload-free acknowledgement for an admin command, if it has one.
    pub fn success_for(command: MessageType) -> Option<Message> {
        use MessageType as T;
        Some(match command.success_status()? {
            T::InitSuccess => Message::InitSuccess,
            T::StartSuccess => Message::StartSuccess,
            T::StopSuccess => Message::StopSuccess,
            T::LockWriteSuccess => Message::LockWriteSuccess,
            T::UnlockWriteSuccess => Message::UnlockWriteSuccess,
            T::MoveDataSuccess => Message::MoveDataSuccess,
            T::UpdateMetadataSuccess => Message::UpdateMetadataSuccess,
            T::ShutdownSuccess => Message::ShutdownSuccess,
            T::TransferPutSuccess => Message::TransferPutSuccess,
            T::ReportReceived => Message::ReportReceived,
            _ => return None,
        })
    }
}

//! Framing and payload encoding.
//!
//! On a stream every message is framed as a 4-byte big-endian length followed
//! by the body; a heartbeat datagram is the bare body. The body is the tag
//! byte and then the payload fields in declaration order:
//!
//! - strings and values: `u32` length, then the bytes
//! - hash keys: 16 bytes, big-endian
//! - ranges: start then end
//! - node records: `{ipv4[4], port[2], start[16], end[16]}` (38 bytes)
//! - metadata: a count byte (`len mod 256`) and the node records. Metadata
//!   is always the last field, so the decoder takes the record count from
//!   the remaining length and only cross-checks the count byte.
//!
//! Anything that does not decode cleanly is `StreamingError::Malformed`.

use crate::error::{Result, StreamingError};
use crate::protocol::{Message, MessageType};
use bytes::{Buf, BufMut, BytesMut};
use corelib::hash::HASH_KEY_BYTES;
use corelib::{HashKey, KeyHashRange, Metadata, NodeInfo};
use std::net::{Ipv4Addr, SocketAddrV4};
use storage::CacheStrategy;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encoded size of one node record.
pub const NODE_RECORD_LEN: usize = 4 + 2 + 2 * HASH_KEY_BYTES;

/// Encode a message body (tag and payload, no length prefix).
pub fn encode_message(message: &Message) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(message.message_type() as u8);
    match message {
        Message::Get { key }
        | Message::Delete { key }
        | Message::GetError { key }
        | Message::PutSuccess { key }
        | Message::PutUpdate { key }
        | Message::PutError { key }
        | Message::DeleteSuccess { key }
        | Message::DeleteError { key } => put_bytes(&mut buf, key.as_bytes()),
        Message::Put { key, value } | Message::GetSuccess { key, value } => {
            put_bytes(&mut buf, key.as_bytes());
            put_bytes(&mut buf, value);
        }
        Message::TransferPut { hash, value } => {
            buf.put_slice(&hash.to_bytes());
            put_bytes(&mut buf, value);
        }
        Message::ServerNotResponsible { metadata } | Message::UpdateMetadata { metadata } => {
            encode_metadata(&mut buf, metadata)
        }
        Message::Init {
            cache_size,
            strategy,
            report_addr,
            metadata,
        } => {
            buf.put_u32(*cache_size);
            put_bytes(&mut buf, strategy.name().as_bytes());
            buf.put_slice(&report_addr.ip().octets());
            buf.put_u16(report_addr.port());
            encode_metadata(&mut buf, metadata);
        }
        Message::MoveData { range, target } => {
            put_range(&mut buf, range);
            encode_node(&mut buf, target);
        }
        Message::AdminError { reason } => put_bytes(&mut buf, reason.as_bytes()),
        Message::ServerFailed { range } => put_range(&mut buf, range),
        Message::Heartbeat { sender } => buf.put_slice(&sender.to_bytes()),
        Message::TransferPutSuccess
        | Message::TransferPutError
        | Message::ServerStopped
        | Message::ServerWriteLock
        | Message::Start
        | Message::Stop
        | Message::LockWrite
        | Message::UnlockWrite
        | Message::Shutdown
        | Message::InitSuccess
        | Message::StartSuccess
        | Message::StopSuccess
        | Message::LockWriteSuccess
        | Message::UnlockWriteSuccess
        | Message::MoveDataSuccess
        | Message::UpdateMetadataSuccess
        | Message::ShutdownSuccess
        | Message::ReportReceived => {}
    }
    buf
}

/// Decode a message body produced by `encode_message`.
pub fn decode_message(mut buf: &[u8]) -> Result<Message> {
    need(&buf, 1, "tag")?;
    let tag = MessageType::try_from(buf.get_u8())?;
    let buf = &mut buf;
    use MessageType as T;
    let message = match tag {
        T::Get => Message::Get { key: get_string(buf)? },
        T::Delete => Message::Delete { key: get_string(buf)? },
        T::GetError => Message::GetError { key: get_string(buf)? },
        T::PutSuccess => Message::PutSuccess { key: get_string(buf)? },
        T::PutUpdate => Message::PutUpdate { key: get_string(buf)? },
        T::PutError => Message::PutError { key: get_string(buf)? },
        T::DeleteSuccess => Message::DeleteSuccess { key: get_string(buf)? },
        T::DeleteError => Message::DeleteError { key: get_string(buf)? },
        T::Put => Message::Put {
            key: get_string(buf)?,
            value: get_bytes(buf)?,
        },
        T::GetSuccess => Message::GetSuccess {
            key: get_string(buf)?,
            value: get_bytes(buf)?,
        },
        T::TransferPut => Message::TransferPut {
            hash: get_hash(buf)?,
            value: get_bytes(buf)?,
        },
        T::ServerNotResponsible => Message::ServerNotResponsible {
            metadata: decode_metadata(buf)?,
        },
        T::UpdateMetadata => Message::UpdateMetadata {
            metadata: decode_metadata(buf)?,
        },
        T::Init => {
            need(buf, 4, "cache size")?;
            let cache_size = buf.get_u32();
            let name = get_string(buf)?;
            let strategy = name
                .parse::<CacheStrategy>()
                .map_err(|e| StreamingError::Malformed(e.to_string()))?;
            need(buf, 6, "report address")?;
            let ip = Ipv4Addr::from(buf.get_u32());
            let port = buf.get_u16();
            Message::Init {
                cache_size,
                strategy,
                report_addr: SocketAddrV4::new(ip, port),
                metadata: decode_metadata(buf)?,
            }
        }
        T::MoveData => Message::MoveData {
            range: get_range(buf)?,
            target: decode_node(buf)?,
        },
        T::AdminError => Message::AdminError {
            reason: get_string(buf)?,
        },
        T::ServerFailed => Message::ServerFailed {
            range: get_range(buf)?,
        },
        T::Heartbeat => Message::Heartbeat {
            sender: get_hash(buf)?,
        },
        T::TransferPutSuccess => Message::TransferPutSuccess,
        T::TransferPutError => Message::TransferPutError,
        T::ServerStopped => Message::ServerStopped,
        T::ServerWriteLock => Message::ServerWriteLock,
        T::Start => Message::Start,
        T::Stop => Message::Stop,
        T::LockWrite => Message::LockWrite,
        T::UnlockWrite => Message::UnlockWrite,
        T::Shutdown => Message::Shutdown,
        T::InitSuccess => Message::InitSuccess,
        T::StartSuccess => Message::StartSuccess,
        T::StopSuccess => Message::StopSuccess,
        T::LockWriteSuccess => Message::LockWriteSuccess,
        T::UnlockWriteSuccess => Message::UnlockWriteSuccess,
        T::MoveDataSuccess => Message::MoveDataSuccess,
        T::UpdateMetadataSuccess => Message::UpdateMetadataSuccess,
        T::ShutdownSuccess => Message::ShutdownSuccess,
        T::ReportReceived => Message::ReportReceived,
    };
    if buf.has_remaining() {
        return Err(StreamingError::Malformed(format!(
            "{} trailing bytes after {:?}",
            buf.remaining(),
            tag
        )));
    }
    Ok(message)
}

/// Append the metadata block: count byte, then one record per member.
pub fn encode_metadata(buf: &mut BytesMut, metadata: &Metadata) {
    buf.reserve(1 + metadata.len() * NODE_RECORD_LEN);
    buf.put_u8((metadata.len() % 256) as u8);
    for node in metadata.iter() {
        encode_node(buf, node);
    }
}

/// Decode a metadata block that runs to the end of `buf`.
pub fn decode_metadata(buf: &mut &[u8]) -> Result<Metadata> {
    need(buf, 1, "node count")?;
    let count = buf.get_u8();
    if buf.remaining() % NODE_RECORD_LEN != 0 {
        return Err(StreamingError::Malformed(format!(
            "{} bytes is not a whole number of node records",
            buf.remaining()
        )));
    }
    let n = buf.remaining() / NODE_RECORD_LEN;
    if n % 256 != count as usize {
        return Err(StreamingError::Malformed(format!(
            "count byte {} does not match {} node records",
            count, n
        )));
    }
    let mut nodes = Vec::with_capacity(n);
    for _ in 0..n {
        nodes.push(decode_node(buf)?);
    }
    Ok(Metadata::new(nodes))
}

pub fn encode_node(buf: &mut BytesMut, node: &NodeInfo) {
    buf.put_slice(&node.host.octets());
    buf.put_u16(node.port);
    put_range(buf, &node.write_range);
}

pub fn decode_node(buf: &mut &[u8]) -> Result<NodeInfo> {
    need(buf, NODE_RECORD_LEN, "node record")?;
    let host = Ipv4Addr::from(buf.get_u32());
    let port = buf.get_u16();
    let range = get_range(buf)?;
    Ok(NodeInfo::new(host, port, range))
}

/// Write one length-prefixed frame.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = encode_message(message);
    if body.len() > MAX_FRAME_LEN {
        return Err(StreamingError::FrameTooLarge(body.len()));
    }
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// A peer closing the connection between frames is `ConnectionClosed`.
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(StreamingError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(StreamingError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_message(&body)
}

fn need(buf: &&[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(StreamingError::Malformed(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    need(buf, 4, "length")?;
    let len = buf.get_u32() as usize;
    need(buf, len, "byte string")?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    String::from_utf8(get_bytes(buf)?)
        .map_err(|e| StreamingError::Malformed(format!("invalid UTF-8: {}", e)))
}

fn get_hash(buf: &mut &[u8]) -> Result<HashKey> {
    need(buf, HASH_KEY_BYTES, "hash key")?;
    let mut raw = [0u8; HASH_KEY_BYTES];
    buf.copy_to_slice(&mut raw);
    Ok(HashKey::from_bytes(raw))
}

fn put_range(buf: &mut BytesMut, range: &KeyHashRange) {
    buf.put_slice(&range.start_bytes());
    buf.put_slice(&range.end_bytes());
}

fn get_range(buf: &mut &[u8]) -> Result<KeyHashRange> {
    let start = get_hash(buf)?;
    let end = get_hash(buf)?;
    Ok(KeyHashRange::new(start, end))
}

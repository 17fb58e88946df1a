//! Client that routes requests by key hash.
//!
//! The client keeps a metadata snapshot and sends each request to the node
//! owning the key's hash. A `ServerNotResponsible` reply carries the node's
//! newer metadata; the client adopts it and retries.

use crate::error::{ClusterError, Result};
use corelib::{HashKey, Metadata};
use std::time::Duration;
use storage::PutOutcome;
use streaming::{read_message, write_message, Message};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_REDIRECTS: usize = 3;

#[derive(Debug)]
pub struct KvClient {
    metadata: Metadata,
    timeout: Duration,
    max_redirects: usize,
}

impl KvClient {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            timeout: DEFAULT_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub async fn put(&mut self, key: &str, value: Vec<u8>) -> Result<PutOutcome> {
        let request = Message::Put {
            key: key.to_string(),
            value,
        };
        match self.request(key, request).await? {
            Message::PutSuccess { .. } => Ok(PutOutcome::Inserted),
            Message::PutUpdate { .. } => Ok(PutOutcome::Updated),
            other => Err(unexpected("PUT", &other)),
        }
    }

    /// `None` if the key does not exist.
    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let request = Message::Get { key: key.to_string() };
        match self.request(key, request).await? {
            Message::GetSuccess { value, .. } => Ok(Some(value)),
            Message::GetError { .. } => Ok(None),
            other => Err(unexpected("GET", &other)),
        }
    }

    /// Returns `false` if there was nothing to delete.
    pub async fn delete(&mut self, key: &str) -> Result<bool> {
        let request = Message::Delete { key: key.to_string() };
        match self.request(key, request).await? {
            Message::DeleteSuccess { .. } => Ok(true),
            Message::DeleteError { .. } => Ok(false),
            other => Err(unexpected("DELETE", &other)),
        }
    }

    async fn request(&mut self, key: &str, request: Message) -> Result<Message> {
        let hash = HashKey::of_key(key);
        for _ in 0..=self.max_redirects {
            let node = self.metadata.responsible_for(hash).ok_or(ClusterError::EmptyRing)?;
            let addr = node.addr();
            let reply = timeout(self.timeout, exchange(addr, &request))
                .await
                .map_err(|_| ClusterError::Protocol(format!("{} did not answer in time", addr)))??;
            match reply {
                Message::ServerNotResponsible { metadata } => {
                    debug!(%addr, %hash, "redirected; adopting newer metadata");
                    self.metadata = metadata;
                }
                Message::ServerStopped => return Err(ClusterError::ServerStopped),
                Message::ServerWriteLock => return Err(ClusterError::WriteLocked),
                reply => return Ok(reply),
            }
        }
        Err(ClusterError::Protocol(format!(
            "no responsible node for {} after {} redirects",
            key, self.max_redirects
        )))
    }
}

async fn exchange(addr: std::net::SocketAddr, request: &Message) -> Result<Message> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    write_message(&mut stream, request).await?;
    Ok(read_message(&mut stream).await?)
}

fn unexpected(op: &str, reply: &Message) -> ClusterError {
    ClusterError::Protocol(format!("{} answered with {:?}", op, reply.message_type()))
}

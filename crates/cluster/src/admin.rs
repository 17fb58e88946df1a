//! Orchestrator-side connection to one node's admin interface.
//!
//! Each admin command expects exactly one success status in reply. Anything
//! else (an `AdminError`, a different status, a timeout or a dropped
//! connection) fails the command. Every reply is awaited with the connect
//! timeout except `MOVE_DATA`'s, which may take as long as the transfer.

use crate::config::ConnectSettings;
use crate::error::{ClusterError, Result};
use corelib::{KeyHashRange, Metadata, NodeInfo};
use std::net::{SocketAddr, SocketAddrV4};
use storage::CacheConfig;
use streaming::{read_message, write_message, Message, MessageType};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct AdminChannel {
    addr: SocketAddr,
    settings: ConnectSettings,
    stream: Option<TcpStream>,
    healthy: bool,
    /// Reconnects performed after the initial connection.
    reconnects: u32,
    closed: bool,
}

impl AdminChannel {
    /// Connect to a node, retrying while it starts up.
    pub async fn connect(addr: SocketAddr, settings: ConnectSettings) -> Result<Self> {
        let stream = connect_with_retry(addr, &settings).await?;
        Ok(Self {
            addr,
            settings,
            stream: Some(stream),
            healthy: true,
            reconnects: 0,
            closed: false,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// False after the last command failed at the transport level.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    pub async fn init(
        &mut self,
        metadata: &Metadata,
        cache: CacheConfig,
        report_addr: SocketAddrV4,
    ) -> Result<()> {
        let cache_size = u32::try_from(cache.capacity).unwrap_or(u32::MAX);
        self.command(Message::Init {
            cache_size,
            strategy: cache.strategy,
            report_addr,
            metadata: metadata.clone(),
        })
        .await
    }

    pub async fn start(&mut self) -> Result<()> {
        self.command(Message::Start).await
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.command(Message::Stop).await
    }

    pub async fn lock_write(&mut self) -> Result<()> {
        self.command(Message::LockWrite).await
    }

    pub async fn unlock_write(&mut self) -> Result<()> {
        self.command(Message::UnlockWrite).await
    }

    /// Move `range` to `target`. Waits without a deadline.
    pub async fn move_data(&mut self, range: KeyHashRange, target: NodeInfo) -> Result<()> {
        self.command(Message::MoveData { range, target }).await
    }

    pub async fn update_metadata(&mut self, metadata: &Metadata) -> Result<()> {
        self.command(Message::UpdateMetadata {
            metadata: metadata.clone(),
        })
        .await
    }

    /// Terminate the node. The channel is closed afterwards.
    pub async fn shutdown(&mut self) -> Result<()> {
        let result = self.command(Message::Shutdown).await;
        self.stream = None;
        self.closed = true;
        result
    }

    async fn command(&mut self, command: Message) -> Result<()> {
        let kind = command.message_type();
        let expected = kind
            .success_status()
            .ok_or_else(|| ClusterError::Protocol(format!("{:?} is not an admin command", kind)))?;
        match self.exchange(&command, kind).await {
            Ok(reply) if reply.message_type() == expected => {
                self.healthy = true;
                Ok(())
            }
            Ok(Message::AdminError { reason }) => {
                self.healthy = true;
                Err(ClusterError::Protocol(format!("{} rejected {:?}: {}", self.addr, kind, reason)))
            }
            Ok(reply) => {
                self.healthy = true;
                Err(ClusterError::Protocol(format!(
                    "{} answered {:?} with {:?}",
                    self.addr,
                    kind,
                    reply.message_type()
                )))
            }
            Err(e) => {
                warn!(node = %self.addr, command = ?kind, error = %e, "admin command failed");
                self.healthy = false;
                self.stream = None;
                Err(e)
            }
        }
    }

    async fn exchange(&mut self, command: &Message, kind: MessageType) -> Result<Message> {
        if self.closed {
            return Err(ClusterError::Protocol(format!("channel to {} is closed", self.addr)));
        }
        if self.stream.is_none() {
            debug!(node = %self.addr, "reconnecting admin channel");
            self.stream = Some(connect_with_retry(self.addr, &self.settings).await?);
            self.reconnects += 1;
        }
        let limit = self.settings.timeout;
        let addr = self.addr;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ClusterError::Protocol(format!("no connection to {}", addr)))?;

        timeout(limit, write_message(stream, command))
            .await
            .map_err(|_| timed_out(addr, kind))??;
        let reply = if kind == MessageType::MoveData {
            read_message(stream).await?
        } else {
            timeout(limit, read_message(stream))
                .await
                .map_err(|_| timed_out(addr, kind))??
        };
        Ok(reply)
    }
}

fn timed_out(addr: SocketAddr, kind: MessageType) -> ClusterError {
    ClusterError::Protocol(format!("{} did not answer {:?} in time", addr, kind))
}

async fn connect_with_retry(addr: SocketAddr, settings: &ConnectSettings) -> Result<TcpStream> {
    let attempts = settings.retries.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match timeout(settings.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Ok(Err(e)) => last_error = Some(e.to_string()),
            Err(_) => last_error = Some("connect timed out".to_string()),
        }
        debug!(node = %addr, attempt, "admin connect failed; retrying");
        if attempt < attempts {
            sleep(settings.backoff).await;
        }
    }
    Err(ClusterError::Protocol(format!(
        "cannot reach {} after {} attempts: {}",
        addr,
        attempts,
        last_error.unwrap_or_default()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn fast() -> ConnectSettings {
        ConnectSettings {
            timeout: Duration::from_millis(300),
            retries: 3,
            backoff: Duration::from_millis(20),
        }
    }

    /// Answers every request with `reply(request)`.
    async fn fake_node(reply: fn(&Message) -> Option<Message>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    while let Ok(request) = read_message(&mut stream).await {
                        match reply(&request) {
                            Some(answer) => write_message(&mut stream, &answer).await.unwrap(),
                            None => return,
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_success_status_accepted() {
        let addr = fake_node(|m| Message::success_for(m.message_type())).await;
        let mut channel = AdminChannel::connect(addr, fast()).await.unwrap();
        channel.start().await.unwrap();
        channel.lock_write().await.unwrap();
        assert!(channel.is_healthy());
    }

    #[tokio::test]
    async fn test_admin_error_fails_command() {
        let addr = fake_node(|_| {
            Some(Message::AdminError {
                reason: "nope".to_string(),
            })
        })
        .await;
        let mut channel = AdminChannel::connect(addr, fast()).await.unwrap();
        let err = channel.stop().await.unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert!(channel.is_healthy());
    }

    #[tokio::test]
    async fn test_wrong_status_fails_command() {
        let addr = fake_node(|_| Some(Message::StartSuccess)).await;
        let mut channel = AdminChannel::connect(addr, fast()).await.unwrap();
        assert!(channel.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_connection_marks_unhealthy_then_reconnects() {
        // Drops the connection on LOCK_WRITE, acknowledges everything else
        let addr = fake_node(|m| match m {
            Message::LockWrite => None,
            other => Message::success_for(other.message_type()),
        })
        .await;
        let mut channel = AdminChannel::connect(addr, fast()).await.unwrap();
        assert!(channel.lock_write().await.is_err());
        assert!(!channel.is_healthy());

        channel.start().await.unwrap();
        assert!(channel.is_healthy());
        assert_eq!(channel.reconnects(), 1);
    }

    #[tokio::test]
    async fn test_connect_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(AdminChannel::connect(addr, fast()).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_after_shutdown() {
        let addr = fake_node(|m| Message::success_for(m.message_type())).await;
        let mut channel = AdminChannel::connect(addr, fast()).await.unwrap();
        channel.shutdown().await.unwrap();
        assert!(channel.start().await.is_err());
    }
}

//! The node server: storage, client requests and admin commands.
//!
//! A node listens on one TCP address for clients, peers and the
//! orchestrator, and on the same UDP port for heartbeats. Each accepted
//! connection is served by its own task; requests on one connection are
//! handled in order.
//!
//! Client requests are routed by key hash against the node's own write
//! range. A request for a key the node does not own is answered with
//! `ServerNotResponsible` carrying the node's current metadata, so the
//! client can retry at the right node.

use crate::config::NodeConfig;
use crate::error::{ClusterError, Result};
use crate::heartbeat::{self, FailureReporter, Neighbors};
use crate::lifecycle::Lifecycle;
use crate::report::TcpFailureReporter;
use corelib::{HashKey, KeyHashRange, Metadata, NodeInfo};
use parking_lot::Mutex;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use storage::{CacheConfig, PutOutcome, StorageError, Store};
use streaming::{read_message, transfer_range, write_message, Message, StreamingError};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for the orchestrator to handle a failure report.
const REPORT_WAIT: Duration = Duration::from_secs(120);

#[derive(Debug)]
struct NodeState {
    lifecycle: Lifecycle,
    metadata: Arc<Metadata>,
    /// `None` until the node appears in a metadata snapshot. A node that
    /// has been removed from the ring keeps its last range while it drains.
    write_range: Option<KeyHashRange>,
}

struct Shared {
    config: NodeConfig,
    id: HashKey,
    store: Arc<Store>,
    state: Mutex<NodeState>,
    /// Client writes hold it shared from the lock check to the end of the
    /// disk write; `LOCK_WRITE` takes it exclusively, so no acknowledged
    /// write can land after the lock is acknowledged.
    write_gate: RwLock<()>,
    neighbors: watch::Sender<Neighbors>,
    report_addr: watch::Sender<Option<SocketAddrV4>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn publish_neighbors(&self, metadata: &Metadata) {
        let neighbors = Neighbors::from_metadata(metadata, self.id);
        self.neighbors.send_if_modified(|current| {
            if *current == neighbors {
                return false;
            }
            *current = neighbors;
            true
        });
    }

    /// Install a new snapshot, adopting this node's range if it is a member.
    fn install_metadata(&self, state: &mut NodeState, metadata: Metadata) {
        if let Some(own) = metadata.get(self.id) {
            state.write_range = Some(own.write_range);
        }
        let metadata = Arc::new(metadata);
        self.publish_neighbors(&metadata);
        state.metadata = metadata;
    }
}

/// A bound, not yet running, node server.
pub struct NodeServer {
    shared: Arc<Shared>,
    listener: TcpListener,
    socket: Arc<UdpSocket>,
}

impl NodeServer {
    /// Bind the TCP listener and the heartbeat socket and open the store.
    ///
    /// A zero port in the config binds an ephemeral TCP port and reuses its
    /// number for UDP.
    pub async fn bind(mut config: NodeConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let SocketAddr::V4(local) = listener.local_addr()? else {
            return Err(ClusterError::Config("node must listen on IPv4".to_string()));
        };
        config.listen = local;
        let socket = UdpSocket::bind(local).await?;

        let store = Store::open(config.records_dir(), CacheConfig::default())?;
        let id = HashKey::for_address(*local.ip(), local.port());
        let (neighbors, _) = watch::channel(Neighbors::alone(id));
        let (report_addr, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);
        info!(addr = %local, %id, "node bound");

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                id,
                store: Arc::new(store),
                state: Mutex::new(NodeState {
                    lifecycle: Lifecycle::new(),
                    metadata: Arc::new(Metadata::empty()),
                    write_range: None,
                }),
                write_gate: RwLock::new(()),
                neighbors,
                report_addr,
                shutdown,
            }),
            listener,
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.shared.config.listen
    }

    pub fn id(&self) -> HashKey {
        self.shared.id
    }

    /// Serve until `SHUTDOWN` is received.
    pub async fn run(self) -> Result<()> {
        let NodeServer {
            shared,
            listener,
            socket,
        } = self;
        let mut tasks = JoinSet::new();
        let heartbeat = shared.config.heartbeat;
        tasks.spawn(heartbeat::run_sender(
            Arc::clone(&socket),
            shared.neighbors.subscribe(),
            heartbeat,
        ));
        let reporter: Arc<dyn FailureReporter> = Arc::new(TcpFailureReporter::new(
            shared.report_addr.subscribe(),
            shared.config.request_timeout,
            REPORT_WAIT,
        ));
        tasks.spawn(heartbeat::run_monitor(
            socket,
            shared.neighbors.subscribe(),
            heartbeat,
            reporter,
        ));

        let mut shutdown = shared.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = Arc::clone(&shared);
                        tasks.spawn(async move {
                            match serve_connection(&shared, stream).await {
                                Ok(()) | Err(ClusterError::Streaming(StreamingError::ConnectionClosed)) => {}
                                Err(e) => debug!(%peer, error = %e, "connection ended"),
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(_) = tasks.join_next(), if tasks.len() > 2 => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(addr = %shared.config.listen, "node shutting down");
        tasks.shutdown().await;
        Ok(())
    }
}

async fn serve_connection(shared: &Shared, mut stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let request = read_message(&mut stream).await?;
        let is_shutdown = matches!(request, Message::Shutdown);
        let reply = handle_request(shared, request).await;
        write_message(&mut stream, &reply).await?;
        if is_shutdown {
            // Only signalled once the acknowledgement is on the wire.
            shared.shutdown.send_replace(true);
            return Ok(());
        }
    }
}

async fn handle_request(shared: &Shared, request: Message) -> Message {
    match request {
        Message::Get { key } => handle_get(shared, key).await,
        Message::Put { key, value } => handle_put(shared, key, value).await,
        Message::Delete { key } => handle_delete(shared, key).await,
        Message::TransferPut { hash, value } => handle_transfer_put(shared, hash, value).await,
        Message::MoveData { range, target } => match move_data(shared, range, target).await {
            Ok(()) => Message::MoveDataSuccess,
            Err(e) => admin_error(e),
        },
        Message::LockWrite => {
            // Drain client writes that already passed the lock check.
            let _drained = shared.write_gate.write().await;
            admin_reply(shared, Message::LockWrite)
        }
        command if command.message_type().is_admin_command() => admin_reply(shared, command),
        other => Message::AdminError {
            reason: format!("unexpected request {:?}", other.message_type()),
        },
    }
}

fn admin_reply(shared: &Shared, command: Message) -> Message {
    let kind = command.message_type();
    match handle_admin(shared, command) {
        Ok(()) => Message::success_for(kind).unwrap_or_else(|| Message::AdminError {
            reason: format!("no acknowledgement for {:?}", kind),
        }),
        Err(e) => admin_error(e),
    }
}

fn admin_error(e: ClusterError) -> Message {
    warn!(error = %e, "admin command rejected");
    Message::AdminError {
        reason: e.to_string(),
    }
}

/// Routing guard shared by client requests. `Err` carries the reply.
fn check_client(shared: &Shared, hash: HashKey, write: bool) -> std::result::Result<(), Message> {
    let state = shared.state.lock();
    if !state.lifecycle.serves_reads() {
        return Err(Message::ServerStopped);
    }
    if write && state.lifecycle.is_write_locked() {
        return Err(Message::ServerWriteLock);
    }
    match state.write_range {
        Some(range) if range.contains(hash) => Ok(()),
        _ => Err(Message::ServerNotResponsible {
            metadata: Metadata::clone(&state.metadata),
        }),
    }
}

/// Run a store operation on the blocking pool.
async fn on_store<T, F>(shared: &Shared, op: F) -> storage::Result<T>
where
    F: FnOnce(&Store) -> storage::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(&shared.store);
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

async fn handle_get(shared: &Shared, key: String) -> Message {
    let hash = HashKey::of_key(&key);
    if let Err(reply) = check_client(shared, hash, false) {
        return reply;
    }
    match on_store(shared, move |store| store.get(hash)).await {
        Ok(Some(value)) => Message::GetSuccess { key, value },
        Ok(None) => Message::GetError { key },
        Err(e) => {
            error!(%hash, error = %e, "read failed");
            Message::GetError { key }
        }
    }
}

async fn handle_put(shared: &Shared, key: String, value: Vec<u8>) -> Message {
    let hash = HashKey::of_key(&key);
    let _writing = shared.write_gate.read().await;
    if let Err(reply) = check_client(shared, hash, true) {
        return reply;
    }
    match on_store(shared, move |store| store.put(hash, value)).await {
        Ok(PutOutcome::Inserted) => Message::PutSuccess { key },
        Ok(PutOutcome::Updated) => Message::PutUpdate { key },
        Err(e) => {
            error!(%hash, error = %e, "write failed");
            Message::PutError { key }
        }
    }
}

async fn handle_delete(shared: &Shared, key: String) -> Message {
    let hash = HashKey::of_key(&key);
    let _writing = shared.write_gate.read().await;
    if let Err(reply) = check_client(shared, hash, true) {
        return reply;
    }
    match on_store(shared, move |store| store.delete(hash)).await {
        Ok(true) => Message::DeleteSuccess { key },
        Ok(false) => Message::DeleteError { key },
        Err(e) => {
            error!(%hash, error = %e, "delete failed");
            Message::DeleteError { key }
        }
    }
}

/// Records pushed by a peer during rebalancing bypass routing and the write
/// lock; the orchestrator has already decided they belong here.
async fn handle_transfer_put(shared: &Shared, hash: HashKey, value: Vec<u8>) -> Message {
    if !shared.state.lock().lifecycle.accepts_transfers() {
        return Message::TransferPutError;
    }
    match on_store(shared, move |store| store.put(hash, value)).await {
        Ok(_) => Message::TransferPutSuccess,
        Err(e) => {
            error!(%hash, error = %e, "transferred record not stored");
            Message::TransferPutError
        }
    }
}

fn handle_admin(shared: &Shared, command: Message) -> Result<()> {
    let mut state = shared.state.lock();
    match command {
        Message::Init {
            cache_size,
            strategy,
            report_addr,
            metadata,
        } => {
            if !metadata.contains(shared.id) {
                return Err(ClusterError::Invariant(format!(
                    "INIT metadata has no entry for {}",
                    shared.id
                )));
            }
            state.lifecycle.init()?;
            shared.store.reconfigure(CacheConfig {
                capacity: cache_size as usize,
                strategy,
            });
            shared.report_addr.send_replace(Some(report_addr));
            shared.install_metadata(&mut state, metadata);
            info!(range = ?state.write_range, "node initialized");
        }
        Message::Start => state.lifecycle.start()?,
        Message::Stop => state.lifecycle.stop()?,
        Message::LockWrite => state.lifecycle.lock_write()?,
        Message::UnlockWrite => state.lifecycle.unlock_write()?,
        Message::UpdateMetadata { metadata } => {
            shared.install_metadata(&mut state, metadata);
            debug!(members = state.metadata.len(), range = ?state.write_range, "metadata updated");
        }
        Message::Shutdown => state.lifecycle.shutdown(),
        other => {
            return Err(ClusterError::Protocol(format!(
                "{:?} is not an admin command",
                other.message_type()
            )))
        }
    }
    debug!(state = %state.lifecycle.state(), "admin command applied");
    Ok(())
}

/// Migrate `range` to `target`, then drop cached copies.
///
/// Runs without a deadline; the orchestrator waits for as long as the
/// transfer takes.
async fn move_data(shared: &Shared, range: KeyHashRange, target: NodeInfo) -> Result<()> {
    {
        let state = shared.state.lock();
        state.lifecycle.check_move_data()?;
        let owned = state
            .write_range
            .ok_or_else(|| ClusterError::Rejected("MOVE_DATA before INIT".to_string()))?;
        if !range.is_sub_range_of(&owned) {
            return Err(ClusterError::Rejected(format!(
                "{} is not within own range {}",
                range, owned
            )));
        }
    }
    let report = transfer_range(
        shared.store.root(),
        &shared.config.index_dir(),
        range,
        target.addr(),
        shared.config.request_timeout,
    )
    .await?;
    let evicted = shared.store.evict_range(&range);
    info!(%range, target = %target.addr(), records = report.records, bytes = report.bytes, evicted, "range moved");
    Ok(())
}

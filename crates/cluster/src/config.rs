//! Configuration for nodes and the orchestrator.
//!
//! The idle pool is read from a plain text file with one node per line:
//!
//! ```text
//! # name   host        port
//! node1    127.0.0.1   50000
//! node2    127.0.0.1   50001
//! ```

use crate::error::{ClusterError, Result};
use corelib::NodeDescriptor;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;
use storage::CacheConfig;

/// Heartbeat cadence and failure threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    /// Consecutive missed heartbeats before the predecessor is reported.
    pub miss_threshold: u32,
}

impl HeartbeatSettings {
    /// How long the receiver waits before counting a miss.
    pub fn miss_timeout(&self) -> Duration {
        self.interval * 2
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            miss_threshold: 5,
        }
    }
}

/// Settings for one node server.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// TCP address for requests; heartbeats use UDP on the same address.
    pub listen: SocketAddrV4,
    pub data_dir: PathBuf,
    /// Bound on each record acknowledgement during transfers and on reports.
    pub request_timeout: Duration,
    pub heartbeat: HeartbeatSettings,
}

impl NodeConfig {
    pub fn new(listen: SocketAddrV4, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen,
            data_dir: data_dir.into(),
            request_timeout: Duration::from_secs(5),
            heartbeat: HeartbeatSettings::default(),
        }
    }

    /// Root of the record tree.
    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join("records")
    }

    /// Scratch space for range index files.
    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }
}

/// How the orchestrator reaches a freshly launched node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectSettings {
    /// Bound on connecting and on every admin reply except `MOVE_DATA`.
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 20,
            backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Where nodes send failure reports.
    pub report_addr: SocketAddrV4,
    pub connect: ConnectSettings,
    /// Pause between removing a failed node and adding its replacement.
    pub replacement_cooldown: Duration,
    /// Cache settings for replacement nodes.
    pub default_cache: CacheConfig,
}

impl OrchestratorConfig {
    pub fn new(report_addr: SocketAddrV4) -> Self {
        Self {
            report_addr,
            connect: ConnectSettings::default(),
            replacement_cooldown: Duration::from_secs(1),
            default_cache: CacheConfig::default(),
        }
    }
}

/// Parse an idle-pool file.
///
/// Duplicate names, or two entries hashing to the same ring position, are
/// configuration errors.
pub fn parse_pool(text: &str) -> Result<Vec<NodeDescriptor>> {
    let mut pool = Vec::new();
    let mut names = HashSet::new();
    let mut keys = HashSet::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [name, host, port] = fields[..] else {
            return Err(ClusterError::Config(format!(
                "line {}: expected `<name> <host> <port>`, got `{}`",
                lineno + 1,
                line
            )));
        };
        let host: Ipv4Addr = host.parse().map_err(|_| {
            ClusterError::Config(format!("line {}: invalid IPv4 address `{}`", lineno + 1, host))
        })?;
        let port: u16 = port.parse().map_err(|_| {
            ClusterError::Config(format!("line {}: invalid port `{}`", lineno + 1, port))
        })?;
        let node = NodeDescriptor::new(name, host, port);
        if !names.insert(node.name.clone()) {
            return Err(ClusterError::Config(format!("duplicate node name `{}`", node.name)));
        }
        if !keys.insert(node.hash_key()) {
            return Err(ClusterError::Config(format!(
                "duplicate node address {}:{}",
                node.host, node.port
            )));
        }
        pool.push(node);
    }
    Ok(pool)
}

pub fn load_pool(path: impl AsRef<Path>) -> Result<Vec<NodeDescriptor>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| ClusterError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    parse_pool(&text)
}

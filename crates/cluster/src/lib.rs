//! Cluster membership, rebalancing and failure handling.
//!
//! This crate provides:
//! - The node server: client requests, admin state machine, write lock
//! - The orchestrator and its admin channels to each node
//! - Join and leave protocols with range migration and rollback
//! - Heartbeat failure detection and the failure-report side channel
//! - Launchers for starting nodes, and a routing client

pub mod admin;
pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod launcher;
pub mod lifecycle;
pub mod node;
pub mod orchestrator;
pub mod report;

pub use admin::AdminChannel;
pub use client::KvClient;
pub use config::{load_pool, parse_pool, ConnectSettings, HeartbeatSettings, NodeConfig, OrchestratorConfig};
pub use error::{ClusterError, Result};
pub use heartbeat::{FailureDetector, FailureReporter, Neighbors};
pub use launcher::{CommandLauncher, Launcher, LocalLauncher};
pub use lifecycle::{Lifecycle, Phase, ServerState};
pub use node::NodeServer;
pub use orchestrator::{ClusterStatus, MemberStatus, Orchestrator};
pub use report::TcpFailureReporter;

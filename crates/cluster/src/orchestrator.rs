//! Cluster orchestrator: ring membership and rebalancing.
//!
//! The orchestrator is the only writer of ring membership. It owns the ring
//! topology, the pool of idle nodes and one admin channel per member, and
//! runs every operation under a single async mutex so rebalances never
//! overlap.
//!
//! # Join
//!
//! 1. Take a random idle node, add it to the ring, recompute metadata
//! 2. Launch it, connect, `INIT` with the new metadata, `START`
//! 3. If it has a successor: `LOCK_WRITE` both, then the successor moves the
//!    new node's range to it
//! 4. Broadcast the new metadata, `UNLOCK_WRITE` both
//!
//! A failure in steps 2-3 rolls everything back: the node leaves the ring,
//! is shut down and returns to the idle pool. No other member has seen the
//! new metadata at that point, and the successor still has all its records.
//!
//! # Leave
//!
//! 1. Remove the member from the ring, recompute metadata
//! 2. If a successor exists: `LOCK_WRITE` the departing node, send it the
//!    new metadata, and have it move its whole range to the successor
//! 3. Broadcast the new metadata, `SHUTDOWN` the departing node and return
//!    it to the idle pool
//!
//! A failure in step 2 puts the member back with its old metadata.
//!
//! Once records have moved, the ring change is kept even if a later step
//! fails; the error is reported as `ClusterError::Incomplete`.

use crate::admin::AdminChannel;
use crate::config::OrchestratorConfig;
use crate::error::{ClusterError, Result};
use crate::launcher::Launcher;
use crate::report;
use corelib::{HashKey, KeyHashRange, Metadata, NodeDescriptor, NodeInfo, RingTopology};
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use storage::CacheConfig;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// A ring member as the orchestrator manages it.
#[derive(Debug)]
struct Member {
    descriptor: NodeDescriptor,
    channel: AdminChannel,
}

#[derive(Debug, Default)]
struct ClusterState {
    idle: Vec<NodeDescriptor>,
    ring: RingTopology,
    members: HashMap<HashKey, Member>,
}

impl ClusterState {
    fn take_idle(&mut self) -> Result<NodeDescriptor> {
        if self.idle.is_empty() {
            return Err(ClusterError::NoIdleNodes);
        }
        let index = rand::thread_rng().gen_range(0..self.idle.len());
        Ok(self.idle.swap_remove(index))
    }

    /// Current metadata, checked against the tiling invariant.
    fn checked_metadata(&self) -> Result<Arc<Metadata>> {
        let metadata = self.ring.metadata();
        metadata
            .validate()
            .map_err(|e| ClusterError::Invariant(e.to_string()))?;
        Ok(metadata)
    }

    fn member_mut(&mut self, key: HashKey) -> Result<&mut Member> {
        self.members
            .get_mut(&key)
            .ok_or_else(|| ClusterError::Invariant(format!("no admin channel for member {}", key)))
    }

    fn random_member(&self) -> Result<HashKey> {
        let keys: Vec<HashKey> = self.ring.nodes().map(NodeDescriptor::hash_key).collect();
        if keys.is_empty() {
            return Err(ClusterError::EmptyRing);
        }
        Ok(keys[rand::thread_rng().gen_range(0..keys.len())])
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MemberStatus {
    pub name: String,
    pub host: Ipv4Addr,
    pub port: u16,
    pub id: HashKey,
    pub write_range: KeyHashRange,
    pub healthy: bool,
    pub reconnects: u32,
}

/// Snapshot of the cluster for display.
#[derive(Clone, Debug, Serialize)]
pub struct ClusterStatus {
    /// In ring order.
    pub members: Vec<MemberStatus>,
    pub idle: Vec<NodeDescriptor>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    launcher: Arc<dyn Launcher>,
    state: Mutex<ClusterState>,
}

impl Orchestrator {
    /// Every pool entry must have a distinct name and ring position.
    pub fn new(
        pool: Vec<NodeDescriptor>,
        config: OrchestratorConfig,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self> {
        let mut names = HashSet::new();
        let mut keys = HashSet::new();
        for node in &pool {
            if !names.insert(node.name.as_str()) || !keys.insert(node.hash_key()) {
                return Err(ClusterError::Config(format!("duplicate pool entry {}", node)));
            }
        }
        Ok(Self {
            config,
            launcher,
            state: Mutex::new(ClusterState {
                idle: pool,
                ..ClusterState::default()
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Bring up the first `count` members. They are initialized but left
    /// stopped; call `start` to serve clients.
    pub async fn init_service(&self, count: usize, cache: CacheConfig) -> Result<Arc<Metadata>> {
        let mut state = self.state.lock().await;
        if !state.ring.is_empty() {
            return Err(ClusterError::Rejected("service is already initialized".to_string()));
        }
        if count == 0 {
            return Err(ClusterError::Config("at least one node is required".to_string()));
        }
        if count > state.idle.len() {
            return Err(ClusterError::NoIdleNodes);
        }
        let mut chosen = Vec::with_capacity(count);
        for _ in 0..count {
            chosen.push(state.take_idle()?);
        }
        match self.bring_up_all(&mut state, &chosen, cache).await {
            Ok(metadata) => {
                info!(members = metadata.len(), "service initialized");
                Ok(metadata)
            }
            Err(e) => {
                error!(error = %e, "service initialization failed; rolling back");
                for (_, mut member) in state.members.drain() {
                    if let Err(e) = member.channel.shutdown().await {
                        warn!(node = %member.descriptor, error = %e, "shutdown during rollback failed");
                    }
                }
                state.ring = RingTopology::new();
                state.idle.extend(chosen);
                Err(e)
            }
        }
    }

    async fn bring_up_all(
        &self,
        state: &mut ClusterState,
        chosen: &[NodeDescriptor],
        cache: CacheConfig,
    ) -> Result<Arc<Metadata>> {
        for node in chosen {
            state.ring.add(node.clone())?;
        }
        let metadata = state.checked_metadata()?;
        for node in chosen {
            let channel = self.bring_up(node, &metadata, cache).await?;
            state.members.insert(
                node.hash_key(),
                Member {
                    descriptor: node.clone(),
                    channel,
                },
            );
        }
        Ok(metadata)
    }

    /// Launch a node, connect and `INIT` it.
    async fn bring_up(
        &self,
        node: &NodeDescriptor,
        metadata: &Metadata,
        cache: CacheConfig,
    ) -> Result<AdminChannel> {
        self.launcher.launch(node).await?;
        let mut channel = AdminChannel::connect(node.addr(), self.config.connect).await?;
        if let Err(e) = channel.init(metadata, cache, self.config.report_addr).await {
            if let Err(shutdown) = channel.shutdown().await {
                warn!(node = %node, error = %shutdown, "shutdown after failed INIT failed");
            }
            return Err(e);
        }
        info!(node = %node, "node initialized");
        Ok(channel)
    }

    /// Add one idle node to the ring.
    pub async fn add_node(&self, cache: CacheConfig) -> Result<NodeInfo> {
        let mut state = self.state.lock().await;
        self.join(&mut state, cache).await
    }

    /// Add `count` nodes one after another, stopping at the first failure.
    pub async fn add_nodes(&self, count: usize, cache: CacheConfig) -> Result<Vec<NodeInfo>> {
        let mut state = self.state.lock().await;
        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            added.push(self.join(&mut state, cache).await?);
        }
        Ok(added)
    }

    async fn join(&self, state: &mut ClusterState, cache: CacheConfig) -> Result<NodeInfo> {
        let node = state.take_idle()?;
        let key = node.hash_key();
        let successor = match state.ring.add(node.clone()) {
            Ok(successor) => successor.map(|s| s.hash_key()),
            Err(e) => {
                state.idle.push(node);
                return Err(e.into());
            }
        };
        let metadata = match state.checked_metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                self.undo_join(state, &node, None, None).await;
                return Err(e);
            }
        };
        let Some(info) = metadata.get(key).cloned() else {
            self.undo_join(state, &node, None, None).await;
            return Err(ClusterError::Invariant(format!("no metadata for new member {}", node)));
        };
        info!(node = %node, range = %info.write_range, "node joining");

        let mut channel = match self.bring_up(&node, &metadata, cache).await {
            Ok(channel) => channel,
            Err(e) => {
                self.undo_join(state, &node, None, None).await;
                return Err(e);
            }
        };
        if let Err(e) = channel.start().await {
            self.undo_join(state, &node, Some(channel), None).await;
            return Err(e);
        }
        if let Some(successor) = successor {
            if let Err(e) = Self::pull_range(state, &mut channel, successor, &info).await {
                self.undo_join(state, &node, Some(channel), Some(successor)).await;
                return Err(e);
            }
        }

        // Records have moved; from here on the new ring is kept.
        state.members.insert(
            key,
            Member {
                descriptor: node.clone(),
                channel,
            },
        );
        let mut failures = Self::broadcast(state, &metadata).await;
        if let Some(successor) = successor {
            for member in [key, successor] {
                if let Err(e) = state.member_mut(member)?.channel.unlock_write().await {
                    failures.push(format!("unlock {}: {}", member, e));
                }
            }
        }
        if !failures.is_empty() {
            return Err(ClusterError::Incomplete(failures.join("; ")));
        }
        metrics::counter!("ringkv_joins_total").increment(1);
        info!(node = %node, members = metadata.len(), "node joined");
        Ok(info)
    }

    /// Lock the new node and its successor, then have the successor move
    /// the new node's range over.
    async fn pull_range(
        state: &mut ClusterState,
        channel: &mut AdminChannel,
        successor: HashKey,
        info: &NodeInfo,
    ) -> Result<()> {
        channel.lock_write().await?;
        let successor = state.member_mut(successor)?;
        successor.channel.lock_write().await?;
        successor
            .channel
            .move_data(info.write_range, info.clone())
            .await
    }

    async fn undo_join(
        &self,
        state: &mut ClusterState,
        node: &NodeDescriptor,
        channel: Option<AdminChannel>,
        successor: Option<HashKey>,
    ) {
        warn!(node = %node, "join aborted; rolling back");
        metrics::counter!("ringkv_rebalances_aborted_total").increment(1);
        if let Some(successor) = successor.and_then(|k| state.members.get_mut(&k)) {
            if let Err(e) = successor.channel.unlock_write().await {
                warn!(node = %successor.descriptor, error = %e, "unlock during rollback failed");
            }
        }
        if let Some(mut channel) = channel {
            if let Err(e) = channel.shutdown().await {
                warn!(node = %node, error = %e, "shutdown during rollback failed");
            }
        }
        if let Err(e) = state.ring.remove(node.hash_key()) {
            error!(node = %node, error = %e, "rolled-back node was not in the ring");
        }
        state.idle.push(node.clone());
    }

    /// Remove a random member.
    pub async fn remove_node(&self) -> Result<NodeDescriptor> {
        let mut state = self.state.lock().await;
        let key = state.random_member()?;
        self.leave(&mut state, key).await
    }

    pub async fn remove_named(&self, name: &str) -> Result<NodeDescriptor> {
        let mut state = self.state.lock().await;
        let key = state
            .ring
            .nodes()
            .find(|n| n.name == name)
            .map(NodeDescriptor::hash_key)
            .ok_or_else(|| ClusterError::UnknownNode(name.to_string()))?;
        self.leave(&mut state, key).await
    }

    async fn leave(&self, state: &mut ClusterState, key: HashKey) -> Result<NodeDescriptor> {
        let old_metadata = state.ring.metadata();
        let range = state
            .ring
            .range_of(key)
            .ok_or_else(|| ClusterError::Invariant(format!("no range for member {}", key)))?;
        let mut member = state
            .members
            .remove(&key)
            .ok_or_else(|| ClusterError::Invariant(format!("no admin channel for member {}", key)))?;
        let heir = match state.ring.remove(key) {
            Ok(heir) => heir.map(|h| h.hash_key()),
            Err(e) => {
                state.members.insert(key, member);
                return Err(e.into());
            }
        };
        info!(node = %member.descriptor, %range, "node leaving");

        let step = match state.checked_metadata() {
            Ok(metadata) => match heir {
                Some(heir) => Self::push_range(&mut member.channel, range, &metadata, heir)
                    .await
                    .map(|()| metadata),
                None => {
                    warn!(node = %member.descriptor, "removing the last member; its records are dropped");
                    Ok(metadata)
                }
            },
            Err(e) => Err(e),
        };
        let metadata = match step {
            Ok(metadata) => metadata,
            Err(e) => {
                self.undo_leave(state, member, &old_metadata).await;
                return Err(e);
            }
        };

        let mut failures = Self::broadcast(state, &metadata).await;
        if let Err(e) = member.channel.shutdown().await {
            failures.push(format!("shutdown {}: {}", member.descriptor, e));
        }
        state.idle.push(member.descriptor.clone());
        if !failures.is_empty() {
            return Err(ClusterError::Incomplete(failures.join("; ")));
        }
        metrics::counter!("ringkv_leaves_total").increment(1);
        info!(node = %member.descriptor, members = metadata.len(), "node left");
        Ok(member.descriptor)
    }

    /// Lock the departing node, tell it the new ring and have it move its
    /// whole range to its heir.
    async fn push_range(
        channel: &mut AdminChannel,
        range: KeyHashRange,
        metadata: &Metadata,
        heir: HashKey,
    ) -> Result<()> {
        let target = metadata
            .get(heir)
            .cloned()
            .ok_or_else(|| ClusterError::Invariant(format!("no metadata for heir {}", heir)))?;
        channel.lock_write().await?;
        channel.update_metadata(metadata).await?;
        channel.move_data(range, target).await
    }

    async fn undo_leave(&self, state: &mut ClusterState, mut member: Member, old_metadata: &Metadata) {
        warn!(node = %member.descriptor, "leave aborted; rolling back");
        metrics::counter!("ringkv_rebalances_aborted_total").increment(1);
        if let Err(e) = state.ring.add(member.descriptor.clone()) {
            error!(node = %member.descriptor, error = %e, "cannot restore member");
        }
        if let Err(e) = member.channel.update_metadata(old_metadata).await {
            warn!(node = %member.descriptor, error = %e, "restoring metadata failed");
        }
        if let Err(e) = member.channel.unlock_write().await {
            warn!(node = %member.descriptor, error = %e, "unlock during rollback failed");
        }
        state.members.insert(member.descriptor.hash_key(), member);
    }

    /// Push `metadata` to every member in turn. Returns one message per
    /// member that did not acknowledge.
    async fn broadcast(state: &mut ClusterState, metadata: &Metadata) -> Vec<String> {
        let mut failures = Vec::new();
        for member in state.members.values_mut() {
            if let Err(e) = member.channel.update_metadata(metadata).await {
                warn!(node = %member.descriptor, error = %e, "metadata update failed");
                failures.push(format!("update {}: {}", member.descriptor, e));
            }
        }
        failures
    }

    /// Remove the member that owned `range` after its neighbor reported it
    /// dead, then add a replacement after the cooldown.
    ///
    /// Returns `false` for a stale report: no current member owns `range`.
    pub async fn handle_failure(&self, range: KeyHashRange) -> Result<bool> {
        {
            let mut state = self.state.lock().await;
            let current = state.ring.metadata();
            let Some(failed) = current.iter().find(|n| n.write_range == range).cloned() else {
                info!(%range, "stale failure report ignored");
                return Ok(false);
            };
            state.ring.remove(failed.id)?;
            let descriptor = state.members.remove(&failed.id).map(|m| m.descriptor);
            let metadata = state.checked_metadata()?;
            warn!(node = ?descriptor, %range, "failed node removed; its records are lost");
            let failures = Self::broadcast(&mut state, &metadata).await;
            if !failures.is_empty() {
                warn!(failures = failures.len(), "metadata broadcast after failure was incomplete");
            }
            metrics::counter!("ringkv_failures_handled_total").increment(1);
        }

        tokio::time::sleep(self.config.replacement_cooldown).await;

        let mut state = self.state.lock().await;
        if state.idle.is_empty() {
            warn!("no idle node left to replace the failed one");
            return Ok(true);
        }
        match self.join(&mut state, self.config.default_cache).await {
            Ok(info) => info!(node = %info, "replacement node joined"),
            Err(e) => warn!(error = %e, "replacement join failed"),
        }
        Ok(true)
    }

    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut failures = Vec::new();
        for member in state.members.values_mut() {
            if let Err(e) = member.channel.start().await {
                failures.push(format!("start {}: {}", member.descriptor, e));
            }
        }
        aggregate(failures)
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut failures = Vec::new();
        for member in state.members.values_mut() {
            if let Err(e) = member.channel.stop().await {
                failures.push(format!("stop {}: {}", member.descriptor, e));
            }
        }
        aggregate(failures)
    }

    /// Shut every member down. All of them return to the idle pool and the
    /// ring is left empty, even if some did not acknowledge.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut failures = Vec::new();
        let members: Vec<Member> = state.members.drain().map(|(_, m)| m).collect();
        for mut member in members {
            if let Err(e) = member.channel.shutdown().await {
                failures.push(format!("shutdown {}: {}", member.descriptor, e));
            }
            state.idle.push(member.descriptor);
        }
        state.ring = RingTopology::new();
        info!(idle = state.idle.len(), "service shut down");
        aggregate(failures)
    }

    pub async fn metadata(&self) -> Arc<Metadata> {
        self.state.lock().await.ring.metadata()
    }

    pub async fn status(&self) -> ClusterStatus {
        let state = self.state.lock().await;
        let metadata = state.ring.metadata();
        let members = metadata
            .iter()
            .map(|info| {
                let member = state.members.get(&info.id);
                MemberStatus {
                    name: member.map(|m| m.descriptor.name.clone()).unwrap_or_default(),
                    host: info.host,
                    port: info.port,
                    id: info.id,
                    write_range: info.write_range,
                    healthy: member.map_or(false, |m| m.channel.is_healthy()),
                    reconnects: member.map_or(0, |m| m.channel.reconnects()),
                }
            })
            .collect();
        ClusterStatus {
            members,
            idle: state.idle.clone(),
        }
    }

    /// Accept failure reports on `listener` and handle each one.
    pub async fn serve_failure_reports(self: Arc<Self>, listener: TcpListener) {
        report::serve_failure_reports(listener, move |range| {
            let orchestrator = Arc::clone(&self);
            async move { orchestrator.handle_failure(range).await }
        })
        .await
    }
}

fn aggregate(failures: Vec<String>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(ClusterError::Protocol(failures.join("; ")))
    }
}

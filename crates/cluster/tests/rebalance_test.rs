//! End-to-end rebalancing tests with in-process nodes.
//!
//! # Test Strategy
//!
//! 1. **Join**: after adding a node, every key is stored on exactly one node,
//!    and that node's range contains the key's hash
//! 2. **Leave**: a departing node's keys end up at its former successor
//! 3. **Failure**: a killed node is detected, removed and replaced, and the
//!    ring keeps tiling the hash space
//! 4. **Rollback**: a join or leave that fails before records move leaves the
//!    ring, the idle pool and every member's write lock as they were; one
//!    that fails after records moved keeps the new ring and says so

use async_trait::async_trait;
use cluster::{
    AdminChannel, ClusterError, ConnectSettings, HeartbeatSettings, KvClient, Launcher, LocalLauncher,
    NodeConfig, Orchestrator, OrchestratorConfig,
};
use corelib::{HashKey, KeyHashRange, Metadata, NodeDescriptor, NodeInfo};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use storage::layout::record_path;
use storage::CacheConfig;
use tokio::net::TcpListener;

struct TestCluster {
    _dir: tempfile::TempDir,
    launcher: Arc<LocalLauncher>,
    orchestrator: Arc<Orchestrator>,
}

fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

fn fast_connect() -> ConnectSettings {
    ConnectSettings {
        timeout: Duration::from_secs(2),
        retries: 40,
        backoff: Duration::from_millis(25),
    }
}

fn local(launcher: Arc<LocalLauncher>) -> Arc<dyn Launcher> {
    launcher
}

async fn cluster(pool_size: usize, heartbeat: HeartbeatSettings) -> TestCluster {
    cluster_with(pool_size, heartbeat, local).await
}

async fn cluster_with(
    pool_size: usize,
    heartbeat: HeartbeatSettings,
    wrap: fn(Arc<LocalLauncher>) -> Arc<dyn Launcher>,
) -> TestCluster {
    let dir = tempfile::tempdir().unwrap();
    let pool: Vec<NodeDescriptor> = (0..pool_size)
        .map(|i| NodeDescriptor::new(format!("node{}", i), Ipv4Addr::LOCALHOST, free_port()))
        .collect();

    let mut template = NodeConfig::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), dir.path());
    template.heartbeat = heartbeat;
    template.request_timeout = Duration::from_secs(2);
    let launcher = Arc::new(LocalLauncher::new(dir.path(), template));

    let reports = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let SocketAddr::V4(report_addr) = reports.local_addr().unwrap() else {
        unreachable!("bound to an IPv4 address");
    };
    let mut config = OrchestratorConfig::new(report_addr);
    config.connect = fast_connect();
    config.replacement_cooldown = Duration::from_millis(100);

    let orchestrator = Arc::new(Orchestrator::new(pool, config, wrap(launcher.clone())).unwrap());
    tokio::spawn(Arc::clone(&orchestrator).serve_failure_reports(reports));
    TestCluster {
        _dir: dir,
        launcher,
        orchestrator,
    }
}

/// Slow enough that a busy test machine never looks like a dead node.
fn relaxed() -> HeartbeatSettings {
    HeartbeatSettings {
        interval: Duration::from_millis(200),
        miss_threshold: 10,
    }
}

/// No failure report can fire while a test runs.
fn silent() -> HeartbeatSettings {
    HeartbeatSettings {
        interval: Duration::from_secs(10),
        miss_threshold: 100,
    }
}

/// Launches nodes that already serve on their own, so INIT is refused.
struct PreStartedLauncher(Arc<LocalLauncher>);

#[async_trait]
impl Launcher for PreStartedLauncher {
    async fn launch(&self, node: &NodeDescriptor) -> cluster::Result<()> {
        self.0.launch(node).await?;
        let id = node.hash_key();
        let alone = NodeInfo::new(node.host, node.port, KeyHashRange::owned_by(id, id));
        let mut admin = AdminChannel::connect(node.addr(), fast_connect()).await?;
        let report = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);
        admin
            .init(&Metadata::new(vec![alone]), CacheConfig::default(), report)
            .await?;
        admin.start().await
    }
}

fn pre_started(launcher: Arc<LocalLauncher>) -> Arc<dyn Launcher> {
    Arc::new(PreStartedLauncher(launcher))
}

/// Put a plain file where a node's index directory goes, so its next
/// MOVE_DATA fails before any record is sent.
fn block_index(cluster: &TestCluster, name: &str) -> std::path::PathBuf {
    let path = cluster.launcher.index_dir(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"not a directory").unwrap();
    path
}

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("key-{:04}", i)).collect()
}

async fn populate(metadata: &Metadata, keys: &[String]) {
    let mut client = KvClient::new(metadata.clone());
    for key in keys {
        client.put(key, format!("value-of-{}", key).into_bytes()).await.unwrap();
    }
}

/// Which node names hold a record for each key, read straight off disk.
async fn holders(cluster: &TestCluster, keys: &[String]) -> HashMap<String, Vec<String>> {
    let status = cluster.orchestrator.status().await;
    let mut names: Vec<String> = status.members.iter().map(|m| m.name.clone()).collect();
    names.extend(status.idle.iter().map(|n| n.name.clone()));
    keys.iter()
        .map(|key| {
            let hash = HashKey::of_key(key);
            let found = names
                .iter()
                .filter(|name| record_path(&cluster.launcher.records_dir(name), hash).is_file())
                .cloned()
                .collect();
            (key.clone(), found)
        })
        .collect()
}

/// Every key is stored exactly once, on the node whose range contains it,
/// and is readable through the routing client.
async fn assert_placement(cluster: &TestCluster, keys: &[String]) {
    let status = cluster.orchestrator.status().await;
    let metadata = cluster.orchestrator.metadata().await;
    metadata.validate().unwrap();

    let held = holders(cluster, keys).await;
    for key in keys {
        let hash = HashKey::of_key(key);
        let on = &held[key];
        assert_eq!(on.len(), 1, "{} stored on {:?}", key, on);
        let owner = status.members.iter().find(|m| m.name == on[0]).unwrap();
        assert!(owner.write_range.contains(hash), "{} held outside its range by {}", key, owner.name);
    }

    let mut client = KvClient::new(Metadata::clone(&metadata));
    for key in keys {
        let value = client.get(key).await.unwrap();
        assert_eq!(value, Some(format!("value-of-{}", key).into_bytes()), "{}", key);
    }
}

// ============================================================================
// Join
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_preserves_data() {
    let cluster = cluster(5, relaxed()).await;
    let metadata = cluster
        .orchestrator
        .init_service(3, CacheConfig::default())
        .await
        .unwrap();
    cluster.orchestrator.start().await.unwrap();
    let keys = keys(300);
    populate(&metadata, &keys).await;
    assert_placement(&cluster, &keys).await;

    let joined = cluster.orchestrator.add_node(CacheConfig::default()).await.unwrap();
    let status = cluster.orchestrator.status().await;
    assert_eq!(status.members.len(), 4);
    assert_eq!(status.idle.len(), 1);
    assert!(status.members.iter().any(|m| m.id == joined.id));
    assert_placement(&cluster, &keys).await;

    // The new node took over the keys in its range
    let held = holders(&cluster, &keys).await;
    let new_name = &status.members.iter().find(|m| m.id == joined.id).unwrap().name;
    for key in &keys {
        let owned = joined.write_range.contains(HashKey::of_key(key));
        assert_eq!(&held[key][0] == new_name, owned, "{}", key);
    }

    // Writes work everywhere once the locks are released
    let mut client = KvClient::new(Metadata::clone(&*cluster.orchestrator.metadata().await));
    for key in keys.iter().take(20) {
        client.put(key, format!("value-of-{}", key).into_bytes()).await.unwrap();
    }
    cluster.orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_then_leave_all_but_one() {
    let cluster = cluster(4, relaxed()).await;
    let metadata = cluster
        .orchestrator
        .init_service(1, CacheConfig::default())
        .await
        .unwrap();
    cluster.orchestrator.start().await.unwrap();
    let keys = keys(120);
    populate(&metadata, &keys).await;

    cluster
        .orchestrator
        .add_nodes(3, CacheConfig::default())
        .await
        .unwrap();
    assert_placement(&cluster, &keys).await;

    for _ in 0..3 {
        cluster.orchestrator.remove_node().await.unwrap();
        assert_placement(&cluster, &keys).await;
    }
    let status = cluster.orchestrator.status().await;
    assert_eq!(status.members.len(), 1);
    assert!(status.members[0].write_range.is_full());
    cluster.orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_pool_rejects_join() {
    let cluster = cluster(2, relaxed()).await;
    cluster
        .orchestrator
        .init_service(2, CacheConfig::default())
        .await
        .unwrap();
    let err = cluster
        .orchestrator
        .add_node(CacheConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::NoIdleNodes));
    assert_eq!(cluster.orchestrator.metadata().await.len(), 2);
    cluster.orchestrator.shutdown().await.unwrap();
}

// ============================================================================
// Leave
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leave_preserves_data() {
    let cluster = cluster(4, relaxed()).await;
    let metadata = cluster
        .orchestrator
        .init_service(4, CacheConfig::default())
        .await
        .unwrap();
    cluster.orchestrator.start().await.unwrap();
    let keys = keys(300);
    populate(&metadata, &keys).await;

    let status = cluster.orchestrator.status().await;
    let leaving = status.members[1].clone();
    let heir_id = metadata.successor_of(leaving.id).unwrap().id;
    let heir_name = status.members.iter().find(|m| m.id == heir_id).unwrap().name.clone();
    let moved: Vec<String> = keys
        .iter()
        .filter(|k| leaving.write_range.contains(HashKey::of_key(k)))
        .cloned()
        .collect();
    assert!(!moved.is_empty());

    let removed = cluster.orchestrator.remove_named(&leaving.name).await.unwrap();
    assert_eq!(removed.name, leaving.name);

    let status = cluster.orchestrator.status().await;
    assert_eq!(status.members.len(), 3);
    assert!(status.idle.iter().any(|n| n.name == leaving.name));
    assert_placement(&cluster, &keys).await;

    let held = holders(&cluster, &moved).await;
    for key in &moved {
        assert_eq!(held[key], vec![heir_name.clone()], "{}", key);
    }
    cluster.orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_node_cannot_leave() {
    let cluster = cluster(2, relaxed()).await;
    cluster
        .orchestrator
        .init_service(2, CacheConfig::default())
        .await
        .unwrap();
    assert!(cluster.orchestrator.remove_named("nope").await.is_err());
    assert_eq!(cluster.orchestrator.metadata().await.len(), 2);
    cluster.orchestrator.shutdown().await.unwrap();
}

// ============================================================================
// Failure
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_node_is_replaced() {
    let heartbeat = HeartbeatSettings {
        interval: Duration::from_millis(50),
        miss_threshold: 4,
    };
    let cluster = cluster(4, heartbeat).await;
    let metadata = cluster
        .orchestrator
        .init_service(3, CacheConfig::default())
        .await
        .unwrap();
    cluster.orchestrator.start().await.unwrap();
    let keys = keys(150);
    populate(&metadata, &keys).await;

    // Let every node hear from its predecessor at least once
    tokio::time::sleep(Duration::from_millis(500)).await;

    let status = cluster.orchestrator.status().await;
    let victim = status.members[0].clone();
    let survivors: Vec<String> = keys
        .iter()
        .filter(|k| !victim.write_range.contains(HashKey::of_key(k)))
        .cloned()
        .collect();
    assert!(cluster.launcher.kill(&victim.name));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let status = cluster.orchestrator.status().await;
        let replaced = status.members.len() == 3
            && status.idle.is_empty()
            && status.members.iter().all(|m| m.name != victim.name);
        if replaced {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "failure was not handled: {:?}", status);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let metadata = cluster.orchestrator.metadata().await;
    metadata.validate().unwrap();
    assert!(!metadata.contains(victim.id));

    // Keys outside the failed node's range survive
    let mut client = KvClient::new(Metadata::clone(&metadata));
    for key in &survivors {
        assert_eq!(
            client.get(key).await.unwrap(),
            Some(format!("value-of-{}", key).into_bytes()),
            "{}",
            key
        );
    }

    // A repeated report for the dead range is stale by now
    assert!(!cluster.orchestrator.handle_failure(victim.write_range).await.unwrap());
    cluster.orchestrator.shutdown().await.unwrap();
}

// ============================================================================
// Rollback
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_rolls_back_when_move_fails() {
    let cluster = cluster(2, relaxed()).await;
    let metadata = cluster
        .orchestrator
        .init_service(1, CacheConfig::default())
        .await
        .unwrap();
    cluster.orchestrator.start().await.unwrap();
    let keys = keys(100);
    populate(&metadata, &keys).await;
    let successor = cluster.orchestrator.status().await.members[0].name.clone();
    let blocked = block_index(&cluster, &successor);

    let err = cluster
        .orchestrator
        .add_node(CacheConfig::default())
        .await
        .unwrap_err();
    assert!(!matches!(err, ClusterError::Incomplete(_)), "{}", err);

    let status = cluster.orchestrator.status().await;
    assert_eq!(status.members.len(), 1);
    assert_eq!(status.idle.len(), 1);
    assert_eq!(*cluster.orchestrator.metadata().await, *metadata);
    assert_placement(&cluster, &keys).await;

    // The successor was unlocked and takes writes again
    let mut client = KvClient::new(Metadata::clone(&metadata));
    for key in keys.iter().take(10) {
        client.put(key, format!("value-of-{}", key).into_bytes()).await.unwrap();
    }

    // The same join succeeds from scratch once the fault is gone
    std::fs::remove_file(blocked).unwrap();
    cluster.orchestrator.add_node(CacheConfig::default()).await.unwrap();
    assert_placement(&cluster, &keys).await;
    cluster.orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_rolls_back_when_init_refused() {
    let cluster = cluster_with(3, relaxed(), pre_started).await;
    let err = cluster
        .orchestrator
        .init_service(2, CacheConfig::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("INIT"), "{}", err);

    let status = cluster.orchestrator.status().await;
    assert!(status.members.is_empty());
    assert_eq!(status.idle.len(), 3);
    assert!(cluster.orchestrator.metadata().await.is_empty());

    // Refused nodes were told to shut down
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while status.idle.iter().any(|n| cluster.launcher.is_running(&n.name)) {
        assert!(tokio::time::Instant::now() < deadline, "refused node still running");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leave_rolls_back_when_move_fails() {
    let cluster = cluster(3, relaxed()).await;
    let metadata = cluster
        .orchestrator
        .init_service(3, CacheConfig::default())
        .await
        .unwrap();
    cluster.orchestrator.start().await.unwrap();
    let keys = keys(150);
    populate(&metadata, &keys).await;
    let leaving = cluster.orchestrator.status().await.members[1].clone();
    let blocked = block_index(&cluster, &leaving.name);

    let err = cluster
        .orchestrator
        .remove_named(&leaving.name)
        .await
        .unwrap_err();
    assert!(!matches!(err, ClusterError::Incomplete(_)), "{}", err);

    let status = cluster.orchestrator.status().await;
    assert_eq!(status.members.len(), 3);
    assert!(status.idle.is_empty());
    assert!(status.members.iter().any(|m| m.name == leaving.name));
    assert_eq!(*cluster.orchestrator.metadata().await, *metadata);
    assert_placement(&cluster, &keys).await;

    // The member got its range back and is unlocked
    let mut client = KvClient::new(Metadata::clone(&metadata));
    let own: Vec<&String> = keys
        .iter()
        .filter(|k| leaving.write_range.contains(HashKey::of_key(k)))
        .collect();
    assert!(!own.is_empty());
    for key in own {
        client.put(key, format!("value-of-{}", key).into_bytes()).await.unwrap();
    }

    std::fs::remove_file(blocked).unwrap();
    cluster.orchestrator.remove_named(&leaving.name).await.unwrap();
    assert_placement(&cluster, &keys).await;
    cluster.orchestrator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leave_after_move_is_kept_when_broadcast_fails() {
    let cluster = cluster(3, silent()).await;
    let metadata = cluster
        .orchestrator
        .init_service(3, CacheConfig::default())
        .await
        .unwrap();
    cluster.orchestrator.start().await.unwrap();
    let keys = keys(150);
    populate(&metadata, &keys).await;

    // Crash one member, then remove the member after it: the move goes to
    // the third node, only the broadcast reaches the dead one
    let status = cluster.orchestrator.status().await;
    let dead = status.members[0].clone();
    let leaving_id = metadata.successor_of(dead.id).unwrap().id;
    let leaving = status.members.iter().find(|m| m.id == leaving_id).unwrap().clone();
    let heir_id = metadata.successor_of(leaving.id).unwrap().id;
    assert_ne!(heir_id, dead.id);
    assert!(cluster.launcher.kill(&dead.name));

    let err = cluster
        .orchestrator
        .remove_named(&leaving.name)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Incomplete(_)), "{}", err);

    let status = cluster.orchestrator.status().await;
    assert!(status.idle.iter().any(|n| n.name == leaving.name));
    let current = cluster.orchestrator.metadata().await;
    current.validate().unwrap();
    assert!(!current.contains(leaving.id));

    // The departed range now lives at the heir and is readable there
    let mut client = KvClient::new(Metadata::clone(&current));
    for key in keys
        .iter()
        .filter(|k| leaving.write_range.contains(HashKey::of_key(k)))
    {
        assert_eq!(
            client.get(key).await.unwrap(),
            Some(format!("value-of-{}", key).into_bytes()),
            "{}",
            key
        );
    }
    let _ = cluster.orchestrator.shutdown().await;
}

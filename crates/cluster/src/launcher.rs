//! Starting node processes.
//!
//! The orchestrator only needs a node to be listening at its address after
//! `launch` returns (or shortly after; the admin channel retries). How it
//! gets there is up to the launcher:
//! - `CommandLauncher` runs an external command per node (a local binary,
//!   or `ssh host ringkv node ...`)
//! - `LocalLauncher` runs nodes as tasks inside the current process, which
//!   is what tests and single-machine demos use

use crate::config::NodeConfig;
use crate::error::{ClusterError, Result};
use crate::node::NodeServer;
use async_trait::async_trait;
use corelib::NodeDescriptor;
use dashmap::DashMap;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, node: &NodeDescriptor) -> Result<()>;
}

/// Runs `program args...` with `{name}`, `{host}` and `{port}` substituted
/// in every argument.
#[derive(Clone, Debug)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn expand(&self, node: &NodeDescriptor) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{name}", &node.name)
                    .replace("{host}", &node.host.to_string())
                    .replace("{port}", &node.port.to_string())
            })
            .collect()
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self, node: &NodeDescriptor) -> Result<()> {
        let args = self.expand(node);
        info!(node = %node, program = %self.program, ?args, "launching node process");
        Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| ClusterError::Launch {
                node: node.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Runs nodes as tasks in this process, one data directory per node name.
pub struct LocalLauncher {
    data_root: PathBuf,
    template: NodeConfig,
    running: DashMap<String, JoinHandle<Result<()>>>,
}

impl LocalLauncher {
    /// `template` supplies timeouts and heartbeat settings; its address and
    /// data directory are replaced per node.
    pub fn new(data_root: impl Into<PathBuf>, template: NodeConfig) -> Self {
        Self {
            data_root: data_root.into(),
            template,
            running: DashMap::new(),
        }
    }

    pub fn data_dir(&self, name: &str) -> PathBuf {
        self.data_root.join(name)
    }

    /// Record root of a node's store.
    pub fn records_dir(&self, name: &str) -> PathBuf {
        self.node_config(name, self.template.listen).records_dir()
    }

    /// Scratch directory for a node's range index files.
    pub fn index_dir(&self, name: &str) -> PathBuf {
        self.node_config(name, self.template.listen).index_dir()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running
            .get(name)
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Abort a node's task without any goodbye, as a crash would.
    pub fn kill(&self, name: &str) -> bool {
        match self.running.remove(name) {
            Some((_, handle)) => {
                handle.abort();
                warn!(node = name, "node killed");
                true
            }
            None => false,
        }
    }

    fn node_config(&self, name: &str, listen: SocketAddrV4) -> NodeConfig {
        NodeConfig {
            listen,
            data_dir: self.data_dir(name),
            ..self.template.clone()
        }
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    async fn launch(&self, node: &NodeDescriptor) -> Result<()> {
        // A node that was shut down may still be releasing its port.
        if let Some((_, previous)) = self.running.remove(&node.name) {
            let abort = previous.abort_handle();
            if tokio::time::timeout(Duration::from_secs(2), previous).await.is_err() {
                abort.abort();
            }
        }
        let config = self.node_config(&node.name, SocketAddrV4::new(node.host, node.port));
        let server = NodeServer::bind(config).await.map_err(|e| ClusterError::Launch {
            node: node.name.clone(),
            reason: e.to_string(),
        })?;
        let name = node.name.clone();
        let handle = tokio::spawn(async move {
            let result = server.run().await;
            if let Err(e) = &result {
                warn!(node = %name, error = %e, "node exited with error");
            }
            result
        });
        self.running.insert(node.name.clone(), handle);
        info!(node = %node, "node task started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_placeholders_expand() {
        let launcher = CommandLauncher::new(
            "ringkv",
            vec!["node".into(), "--listen".into(), "{host}:{port}".into(), "--data-dir".into(), "/var/lib/{name}".into()],
        );
        let node = NodeDescriptor::new("n7", Ipv4Addr::new(10, 0, 0, 7), 5007);
        assert_eq!(
            launcher.expand(&node),
            vec!["node", "--listen", "10.0.0.7:5007", "--data-dir", "/var/lib/n7"]
        );
    }

    #[tokio::test]
    async fn test_local_launch_and_kill() {
        let dir = tempfile::tempdir().unwrap();
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let template = NodeConfig::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), dir.path());
        let launcher = LocalLauncher::new(dir.path(), template);
        let node = NodeDescriptor::new("n1", Ipv4Addr::LOCALHOST, port);
        launcher.launch(&node).await.unwrap();
        assert!(launcher.is_running("n1"));
        assert!(launcher.records_dir("n1").starts_with(dir.path().join("n1")));

        tokio::net::TcpStream::connect(node.addr()).await.unwrap();
        assert!(launcher.kill("n1"));
        assert!(!launcher.kill("n1"));
        assert!(!launcher.is_running("n1"));
    }
}

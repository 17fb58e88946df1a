//! Command-line arguments and the two run modes.

use crate::commands::{Command, CommandResult};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use cluster::{
    load_pool, CommandLauncher, HeartbeatSettings, Launcher, LocalLauncher, NodeConfig,
    NodeServer, Orchestrator, OrchestratorConfig,
};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storage::{CacheConfig, CacheStrategy};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn, Level};

#[derive(Debug, Parser)]
#[command(name = "ringkv", version, about = "Partitioned key-value ring")]
pub struct CliConfig {
    /// Log level: error, warn, info, debug or trace
    #[arg(long, global = true, default_value = "info")]
    pub log_level: Level,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Debug, Subcommand)]
pub enum Mode {
    /// Run a node server
    Node(NodeArgs),
    /// Run the orchestrator, reading commands from stdin
    Orchestrator(OrchestratorArgs),
}

#[derive(Debug, Args)]
pub struct NodeArgs {
    /// TCP address for requests; UDP heartbeats use the same address
    #[arg(long)]
    pub listen: SocketAddrV4,

    #[arg(long)]
    pub data_dir: PathBuf,

    #[command(flatten)]
    pub heartbeat: HeartbeatArgs,

    /// Per-record transfer acknowledgement timeout, in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct HeartbeatArgs {
    #[arg(long, default_value_t = 1000)]
    pub heartbeat_ms: u64,

    /// Missed heartbeats before the predecessor is reported
    #[arg(long, default_value_t = 5)]
    pub miss_threshold: u32,
}

impl HeartbeatArgs {
    fn settings(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_millis(self.heartbeat_ms),
            miss_threshold: self.miss_threshold,
        }
    }
}

#[derive(Debug, Args)]
pub struct OrchestratorArgs {
    /// Idle pool file: one `<name> <ipv4> <port>` per line
    #[arg(long)]
    pub pool: PathBuf,

    /// Address to accept failure reports on
    #[arg(long)]
    pub report: SocketAddrV4,

    /// Run nodes in this process, with data under this directory
    #[arg(long, conflicts_with = "launch")]
    pub local: Option<PathBuf>,

    /// Command that starts a node; `{name}`, `{host}` and `{port}` are
    /// substituted in every argument
    #[arg(long)]
    pub launch: Option<String>,

    /// Nodes to bring up at startup; 0 leaves the ring empty
    #[arg(long, default_value_t = 1)]
    pub nodes: usize,

    #[arg(long, default_value_t = 1024)]
    pub cache_size: usize,

    /// Cache eviction strategy: FIFO, LRU or LFU
    #[arg(long, default_value = "LRU")]
    pub strategy: CacheStrategy,

    /// Seconds between removing a failed node and adding its replacement
    #[arg(long, default_value_t = 1)]
    pub cooldown_secs: u64,

    /// Heartbeat settings for nodes run with `--local`
    #[command(flatten)]
    pub heartbeat: HeartbeatArgs,
}

impl OrchestratorArgs {
    fn cache(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache_size,
            strategy: self.strategy,
        }
    }

    fn launcher(&self) -> Result<Arc<dyn Launcher>> {
        if let Some(root) = &self.local {
            let mut template = NodeConfig::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), root);
            template.heartbeat = self.heartbeat.settings();
            return Ok(Arc::new(LocalLauncher::new(root, template)));
        }
        let Some(command) = &self.launch else {
            bail!("either --local or --launch is required");
        };
        let mut words = command.split_whitespace().map(str::to_string);
        let Some(program) = words.next() else {
            bail!("--launch is empty");
        };
        Ok(Arc::new(CommandLauncher::new(program, words.collect())))
    }
}

impl CliConfig {
    pub fn run(self) -> Result<()> {
        tracing_subscriber::fmt()
            .with_max_level(self.log_level)
            .with_writer(std::io::stderr)
            .init();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("cannot start async runtime")?;
        match self.mode {
            Mode::Node(args) => runtime.block_on(run_node(args)),
            Mode::Orchestrator(args) => runtime.block_on(run_orchestrator(args)),
        }
    }
}

async fn run_node(args: NodeArgs) -> Result<()> {
    let mut config = NodeConfig::new(args.listen, &args.data_dir);
    config.heartbeat = args.heartbeat.settings();
    config.request_timeout = Duration::from_millis(args.timeout_ms);
    let server = NodeServer::bind(config)
        .await
        .with_context(|| format!("cannot start node on {}", args.listen))?;
    info!(addr = %server.local_addr(), id = %server.id(), "node listening");
    server.run().await?;
    Ok(())
}

async fn run_orchestrator(args: OrchestratorArgs) -> Result<()> {
    let pool = load_pool(&args.pool)?;
    info!(idle = pool.len(), "idle pool loaded");
    let cache = args.cache();

    let listener = TcpListener::bind(SocketAddr::V4(args.report))
        .await
        .with_context(|| format!("cannot listen for failure reports on {}", args.report))?;
    let mut config = OrchestratorConfig::new(args.report);
    config.replacement_cooldown = Duration::from_secs(args.cooldown_secs);
    config.default_cache = cache;

    let orchestrator = Arc::new(Orchestrator::new(pool, config, args.launcher()?)?);
    tokio::spawn(Arc::clone(&orchestrator).serve_failure_reports(listener));

    if args.nodes > 0 {
        let metadata = orchestrator.init_service(args.nodes, cache).await?;
        orchestrator.start().await?;
        info!(members = metadata.len(), "ring is up");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command: Command = match line.parse() {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };
        match command.execute(&orchestrator, cache).await {
            Ok(CommandResult::Output(text)) => println!("{}", text),
            Ok(CommandResult::Exit) => break,
            Err(e) => eprintln!("error: {:#}", e),
        }
    }

    if let Err(e) = orchestrator.shutdown().await {
        warn!(error = %e, "some members did not acknowledge shutdown");
    }
    Ok(())
}

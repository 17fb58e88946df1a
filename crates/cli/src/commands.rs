//! Orchestrator console commands.

use anyhow::{anyhow, bail, Result};
use cluster::Orchestrator;
use std::str::FromStr;
use storage::CacheConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Add this many idle nodes to the ring.
    Add(usize),
    /// Remove the named member, or a random one.
    Remove(Option<String>),
    Start,
    Stop,
    Status,
    Metadata,
    Shutdown,
    Quit,
    Help,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            bail!("empty command");
        };
        let arg = words.next();
        if words.next().is_some() {
            bail!("too many arguments for `{}`", verb);
        }
        let command = match (verb.to_ascii_lowercase().as_str(), arg) {
            ("add", None) => Command::Add(1),
            ("add", Some(n)) => Command::Add(
                n.parse()
                    .map_err(|_| anyhow!("`add` takes a node count, got `{}`", n))?,
            ),
            ("remove", name) => Command::Remove(name.map(str::to_string)),
            ("start", None) => Command::Start,
            ("stop", None) => Command::Stop,
            ("status", None) => Command::Status,
            ("metadata", None) => Command::Metadata,
            ("shutdown", None) => Command::Shutdown,
            ("quit" | "exit", None) => Command::Quit,
            ("help", None) => Command::Help,
            (other, _) => bail!("unknown command `{}`; try `help`", other),
        };
        Ok(command)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandResult {
    /// Text to print.
    Output(String),
    Exit,
}

const HELP: &str = "\
add [n]          add n idle nodes (default 1)
remove [name]    remove the named member, or a random one
start | stop     start or stop every member
status           members and idle pool as JSON
metadata         ring ranges, one member per line
shutdown         shut every member down
quit             shut down and exit";

impl Command {
    pub async fn execute(self, orchestrator: &Orchestrator, cache: CacheConfig) -> Result<CommandResult> {
        let output = match self {
            Command::Add(count) => {
                let added = orchestrator.add_nodes(count, cache).await?;
                added
                    .iter()
                    .map(|info| format!("added {}", info))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Command::Remove(Some(name)) => {
                format!("removed {}", orchestrator.remove_named(&name).await?)
            }
            Command::Remove(None) => format!("removed {}", orchestrator.remove_node().await?),
            Command::Start => {
                orchestrator.start().await?;
                "started".to_string()
            }
            Command::Stop => {
                orchestrator.stop().await?;
                "stopped".to_string()
            }
            Command::Status => serde_json::to_string_pretty(&orchestrator.status().await)?,
            Command::Metadata => {
                let metadata = orchestrator.metadata().await;
                if metadata.is_empty() {
                    "ring is empty".to_string()
                } else {
                    metadata.iter().map(|n| n.to_string()).collect::<Vec<_>>().join("\n")
                }
            }
            Command::Shutdown => {
                orchestrator.shutdown().await?;
                "shut down".to_string()
            }
            Command::Help => HELP.to_string(),
            Command::Quit => return Ok(CommandResult::Exit),
        };
        Ok(CommandResult::Output(output))
    }
}

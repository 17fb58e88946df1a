//! Node server lifecycle.
//!
//! ```text
//!   Uninitialized --INIT--> Stopped <--STOP/START--> Running
//!                             \                        /
//!                              +---- SHUTDOWN --------+--> Terminated
//! ```
//!
//! The write lock is orthogonal to the phase: it may be taken while stopped
//! or running, and a locked node keeps serving reads.

use crate::error::{ClusterError, Result};
use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    Uninitialized,
    Stopped,
    Running,
    Terminated,
}

/// Reported state: the phase, with a write-locked running or stopped node
/// shown as `WriteLocked`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ServerState {
    Uninitialized,
    Stopped,
    Running,
    WriteLocked,
    Terminated,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Uninitialized => "uninitialized",
            ServerState::Stopped => "stopped",
            ServerState::Running => "running",
            ServerState::WriteLocked => "write-locked",
            ServerState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lifecycle {
    phase: Phase,
    write_locked: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: Phase::Uninitialized,
            write_locked: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_write_locked(&self) -> bool {
        self.write_locked
    }

    pub fn state(&self) -> ServerState {
        match self.phase {
            Phase::Uninitialized => ServerState::Uninitialized,
            Phase::Terminated => ServerState::Terminated,
            _ if self.write_locked => ServerState::WriteLocked,
            Phase::Stopped => ServerState::Stopped,
            Phase::Running => ServerState::Running,
        }
    }

    /// Stopped nodes may be re-initialized; running or locked ones may not.
    pub fn init(&mut self) -> Result<()> {
        match self.phase {
            Phase::Uninitialized | Phase::Stopped if !self.write_locked => {
                self.phase = Phase::Stopped;
                Ok(())
            }
            _ => Err(self.reject("INIT")),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        match self.phase {
            Phase::Stopped | Phase::Running => {
                self.phase = Phase::Running;
                Ok(())
            }
            _ => Err(self.reject("START")),
        }
    }

    pub fn stop(&mut self) -> Result<()> {
        match self.phase {
            Phase::Stopped | Phase::Running => {
                self.phase = Phase::Stopped;
                Ok(())
            }
            _ => Err(self.reject("STOP")),
        }
    }

    pub fn lock_write(&mut self) -> Result<()> {
        match self.phase {
            Phase::Stopped | Phase::Running => {
                self.write_locked = true;
                Ok(())
            }
            _ => Err(self.reject("LOCK_WRITE")),
        }
    }

    pub fn unlock_write(&mut self) -> Result<()> {
        match self.phase {
            Phase::Stopped | Phase::Running => {
                self.write_locked = false;
                Ok(())
            }
            _ => Err(self.reject("UNLOCK_WRITE")),
        }
    }

    /// Data may only be moved out while writes are locked.
    pub fn check_move_data(&self) -> Result<()> {
        match self.phase {
            Phase::Stopped | Phase::Running if self.write_locked => Ok(()),
            _ => Err(self.reject("MOVE_DATA")),
        }
    }

    /// Accepted from any phase.
    pub fn shutdown(&mut self) {
        self.phase = Phase::Terminated;
        self.write_locked = false;
    }

    pub fn serves_reads(&self) -> bool {
        self.phase == Phase::Running
    }

    pub fn accepts_writes(&self) -> bool {
        self.phase == Phase::Running && !self.write_locked
    }

    /// Migrated records are accepted once initialized, locked or not.
    pub fn accepts_transfers(&self) -> bool {
        matches!(self.phase, Phase::Stopped | Phase::Running)
    }

    fn reject(&self, command: &str) -> ClusterError {
        ClusterError::Rejected(format!("{} not allowed while {}", command, self.state()))
    }
}

//! Worker hosting substrates.
//!
//! A worker runs either as a detached background process (stdio discarded) or
//! as a tmux window. The substrate is chosen once per session and never mixed
//! within a run.

use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};
use tracing::debug;

use crate::tmux;

/// Hosting substrate for worker launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSubstrate {
    /// Detached background process, stdio discarded.
    Process,
    /// Window inside this tmux session.
    TmuxWindow { session: String },
}

impl HostSubstrate {
    /// Launch a worker under this substrate and return its handle.
    pub fn launch(&self, name: &str, program: &str, args: &[String]) -> Result<WorkerHandle> {
        match self {
            Self::Process => {
                let child = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                    .with_context(|| format!("failed to spawn worker process '{program}'"))?;
                debug!(worker = name, pid = child.id(), "worker process spawned");
                Ok(WorkerHandle::Process(child))
            }
            Self::TmuxWindow { session } => {
                let mut command = Vec::with_capacity(args.len() + 1);
                command.push(program.to_string());
                command.extend(args.iter().cloned());
                let window = tmux::new_window(session, name, &command)?;
                Ok(WorkerHandle::Window { id: window })
            }
        }
    }
}

/// Owned handle to one launched worker.
#[derive(Debug)]
pub enum WorkerHandle {
    Process(Child),
    Window { id: String },
}

impl WorkerHandle {
    pub fn kill(&mut self) -> Result<()> {
        match self {
            Self::Process(child) => match child.try_wait() {
                Ok(Some(_)) => Ok(()), // already exited
                _ => child.kill().context("failed to kill worker process"),
            },
            Self::Window { id } => tmux::kill_window(id),
        }
    }

    /// Non-blocking liveness check. Returns `None` while the worker is still
    /// alive, or its exit code once it has finished. Windows report 0 once
    /// gone; their real exit status stays inside tmux.
    pub fn poll(&mut self) -> Result<Option<i32>> {
        match self {
            Self::Process(child) => {
                let status = child
                    .try_wait()
                    .context("failed to poll worker process")?;
                Ok(status.map(|s| s.code().unwrap_or(-1)))
            }
            Self::Window { id } => Ok(if tmux::window_exists(id) { None } else { Some(0) }),
        }
    }

    /// Block until the worker finishes. Window teardown is session-scoped, so
    /// the window variant returns immediately.
    pub fn wait(&mut self) -> Result<()> {
        match self {
            Self::Process(child) => {
                child.wait().context("failed to wait for worker process")?;
                Ok(())
            }
            Self::Window { .. } => Ok(()),
        }
    }

    /// Mark a dead worker's window for postmortem inspection. No-op for plain
    /// processes, which have nothing visible to rename.
    pub fn rename(&self, name: &str) -> Result<()> {
        match self {
            Self::Process(_) => Ok(()),
            Self::Window { id } => tmux::rename_window(id, name),
        }
    }
}

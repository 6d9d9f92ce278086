// OS process backend: spawning, signalling and reaping managed units

use crate::error::{OrchestratorError, Result};
use crate::units::models::UnitDefinition;
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Signal used to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM, lets the process shut down cleanly
    Terminate,
    /// SIGKILL
    Kill,
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Clean exit with status 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// A spawned process owned by its watcher
#[async_trait]
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;

    /// Wait for the process to exit. Must be cancel-safe.
    async fn wait(&mut self) -> Result<ExitInfo>;
}

/// Launches and signals OS processes
#[async_trait]
pub trait ProcessBackend: Send + Sync {
    async fn spawn(&self, def: &UnitDefinition) -> Result<Box<dyn ProcessHandle>>;

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Real processes via tokio::process and POSIX signals
#[derive(Debug, Clone, Default)]
pub struct OsProcessBackend;

struct OsProcessHandle {
    child: Child,
    pid: u32,
}

#[async_trait]
impl ProcessHandle for OsProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        let status = self.child.wait().await?;
        Ok(exit_info(status))
    }
}

#[cfg(unix)]
fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;
    ExitInfo {
        code: status.code(),
        signal: status.signal(),
    }
}

#[cfg(not(unix))]
fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        signal: None,
    }
}

#[async_trait]
impl ProcessBackend for OsProcessBackend {
    async fn spawn(&self, def: &UnitDefinition) -> Result<Box<dyn ProcessHandle>> {
        let mut command = Command::new(&def.command);
        command
            .args(&def.args)
            .envs(&def.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            // Dropping the handle (orchestrator exit) must not leave orphans
            .kill_on_drop(true);

        if let Some(dir) = &def.workdir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            let message = match e.kind() {
                std::io::ErrorKind::NotFound => format!("binary '{}' not found", def.command),
                std::io::ErrorKind::PermissionDenied => {
                    format!("permission denied executing '{}'", def.command)
                }
                _ => e.to_string(),
            };
            OrchestratorError::SpawnFailure {
                unit: def.id.clone(),
                message,
            }
        })?;

        let pid = child.id().ok_or_else(|| OrchestratorError::SpawnFailure {
            unit: def.id.clone(),
            message: "process exited before its pid could be read".to_string(),
        })?;

        tracing::debug!("Spawned {} ({} {:?}) as pid {}", def.id, def.command, def.args, pid);
        Ok(Box::new(OsProcessHandle { child, pid }))
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let sig = match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        match kill(Pid::from_raw(pid as i32), sig) {
            // Already gone
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Failed to send {:?} to pid {}: {}", sig, pid, e)),
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, pid: u32, _signal: StopSignal) -> Result<()> {
        Err(anyhow::anyhow!("Signalling pid {} is only supported on unix", pid))
    }

    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}

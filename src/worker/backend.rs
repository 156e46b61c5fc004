// ABOUTME: Process backends that launch worker processes and watch them exit
//
// Fork duplicates the running primary; Subprocess re-executes the binary.
// Both hand back a ProcessHandle plus the primary's end of the control channel.

use std::time::Duration;

use clap::ValueEnum;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::fork::ForkBackend;
use super::runtime::WorkerMain;
use super::subprocess::SubprocessBackend;
use super::{WorkerError, WorkerId};
use crate::channel::Channel;

/// Which backend launches workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Fork where the platform allows it.
    #[default]
    Auto,
    Fork,
    Subprocess,
}

impl BackendKind {
    /// Collapse `Auto` into a concrete backend.
    #[must_use]
    pub const fn resolve(self) -> Self {
        match self {
            Self::Auto => Self::Fork,
            other => other,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Fork => "fork",
            Self::Subprocess => "subprocess",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings a worker process needs to run its side of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// How long a graceful close may drain the worker main.
    pub graceful_timeout: Duration,
    /// Largest accepted inbound frame payload.
    pub max_payload: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(10),
            max_payload: 16 * 1024 * 1024,
        }
    }
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Process exited normally with exit code
    Exited { code: i32 },
    /// Process was terminated by a signal
    Signaled { signal: i32 },
    /// The process is gone but its status could not be collected
    Unknown,
}

impl ExitStatus {
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        if let Some(code) = status.code() {
            Self::Exited { code }
        } else if let Some(signal) = status.signal() {
            Self::Signaled { signal }
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exit code {code}"),
            Self::Signaled { signal } => write!(f, "signal {signal}"),
            Self::Unknown => f.write_str("unknown status"),
        }
    }
}

/// OS-level handle on a launched worker process.
#[derive(Debug)]
pub enum ProcessHandle {
    /// Child created by fork(2), reaped with waitpid(2).
    Forked { pid: Pid },
    /// Child created by a process launcher.
    Child {
        pid: u32,
        child: tokio::process::Child,
    },
}

impl ProcessHandle {
    /// Wrap a spawned subprocess.
    pub fn from_child(child: tokio::process::Child) -> Result<Self, WorkerError> {
        let pid = child.id().ok_or_else(|| {
            WorkerError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "child exited before its pid was read",
            ))
        })?;
        Ok(Self::Child { pid, child })
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        match self {
            #[allow(clippy::cast_sign_loss)]
            Self::Forked { pid } => pid.as_raw() as u32,
            Self::Child { pid, .. } => *pid,
        }
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        match self {
            Self::Forked { pid } => match waitpid(*pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => Ok(Some(ExitStatus::Exited { code })),
                Ok(WaitStatus::Signaled(_, signal, _)) => Ok(Some(ExitStatus::Signaled {
                    signal: signal as i32,
                })),
                Ok(_) => Ok(None),
                // Already reaped elsewhere
                Err(nix::errno::Errno::ECHILD) => Ok(Some(ExitStatus::Unknown)),
                Err(e) => Err(e.into()),
            },
            Self::Child { child, .. } => Ok(child.try_wait()?.map(ExitStatus::from)),
        }
    }

    /// Terminate the process unconditionally.
    pub fn kill(&mut self) -> std::io::Result<()> {
        match self {
            Self::Forked { pid } => match kill(*pid, Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(e.into()),
            },
            Self::Child { child, .. } => match child.start_kill() {
                Ok(()) => Ok(()),
                // Already exited
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
                Err(e) => Err(e),
            },
        }
    }
}

/// A freshly launched worker process.
#[derive(Debug)]
pub struct Spawned {
    pub process: ProcessHandle,
    pub channel: Box<dyn Channel>,
}

/// Launches worker processes.
#[derive(Debug)]
pub enum Backend {
    Fork(ForkBackend),
    Subprocess(SubprocessBackend),
}

impl Backend {
    /// Build the backend for `kind`.
    ///
    /// `main` only runs in-process for the fork backend; subprocess children
    /// rebuild it themselves after re-executing the binary.
    pub fn new(kind: BackendKind, settings: RuntimeSettings, main: WorkerMain) -> Result<Self, WorkerError> {
        let backend = match kind.resolve() {
            BackendKind::Subprocess => Self::Subprocess(SubprocessBackend::current_exe(settings)?),
            _ => Self::Fork(ForkBackend::new(settings, main)),
        };
        debug!(backend = %backend.kind(), "Worker backend selected");
        Ok(backend)
    }

    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Fork(_) => BackendKind::Fork,
            Self::Subprocess(_) => BackendKind::Subprocess,
        }
    }

    /// Launch the process for worker `id`.
    pub fn spawn(&mut self, id: WorkerId) -> Result<Spawned, WorkerError> {
        match self {
            Self::Fork(backend) => backend.spawn(id),
            Self::Subprocess(backend) => backend.spawn(id),
        }
    }

    /// Forget per-worker bookkeeping once the worker has been reaped.
    pub fn release(&mut self, id: WorkerId) {
        if let Self::Fork(backend) = self {
            backend.release(id);
        }
    }
}

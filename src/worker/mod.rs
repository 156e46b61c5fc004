// ABOUTME: Primary-side handle on one supervised worker process
//
// Key components:
// - Worker: lifecycle state machine Ready -> Started -> Closing -> Terminated
// - backend: fork and subprocess launchers plus OS process handles
// - runtime: the reactor a worker process runs on its side of the channel
// - status: status snapshots and connection tracking inside a worker

pub mod backend;
pub mod fork;
pub mod runtime;
pub mod status;
pub mod subprocess;

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelError, Inbound};
use crate::cluster::Role;
use crate::command::Command;
use crate::events::{ClusterEvent, EventBus};

pub use backend::{Backend, BackendKind, ExitStatus, ProcessHandle, RuntimeSettings, Spawned};
pub use runtime::{WorkerHandle, WorkerMain, WorkerRuntime};

/// Pool-assigned worker identifier. Never reused within one primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic id allocator owned by the primary.
#[derive(Debug)]
pub struct WorkerIds {
    next: u64,
}

impl Default for WorkerIds {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl WorkerIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> WorkerId {
        let id = WorkerId(self.next);
        self.next += 1;
        id
    }
}

/// Message received from a worker, tagged with its id.
pub type TaggedInbound = (WorkerId, Inbound);

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Created, no process yet
    Ready,
    /// Process and channel exist
    Started,
    /// Graceful close requested, waiting for the process to exit
    Closing,
    /// Process killed or confirmed exited
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ready => "ready",
            Self::Started => "started",
            Self::Closing => "closing",
            Self::Terminated => "terminated",
        })
    }
}

/// Errors that can occur when operating a worker
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Operation not allowed in the current lifecycle state
    #[error("Worker {id} cannot {operation} while {state}")]
    InvalidState {
        id: WorkerId,
        operation: &'static str,
        state: WorkerState,
    },

    /// Operation belongs to the other side of the process boundary
    #[error("{operation} is not available in the {role} process")]
    RoleViolation { operation: &'static str, role: Role },

    /// Process could not be launched
    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One supervised worker as seen from the primary.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    role: Role,
    state: WorkerState,
    process: Option<ProcessHandle>,
    channel: Option<Box<dyn Channel>>,
    events: EventBus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<Instant>,
    last_seen: Option<Instant>,
    closing_since: Option<Instant>,
    exit_status: Option<ExitStatus>,
}

impl Worker {
    #[must_use]
    pub fn new(id: WorkerId, role: Role, events: EventBus) -> Self {
        let now = Utc::now();
        Self {
            id,
            role,
            state: WorkerState::Ready,
            process: None,
            channel: None,
            events,
            created_at: now,
            updated_at: now,
            started_at: None,
            last_seen: None,
            closing_since: None,
            exit_status: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> WorkerState {
        self.state
    }

    /// OS pid once started.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ProcessHandle::pid)
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub const fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Time since the process was launched.
    #[must_use]
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// Time of the last heartbeat answer. Primary only.
    pub fn updated_at(&self) -> Result<DateTime<Utc>, WorkerError> {
        self.require_primary("updated_at")?;
        Ok(self.updated_at)
    }

    /// Launch the process through `backend` and start forwarding its messages.
    pub fn start(
        &mut self,
        backend: &mut Backend,
        inbound: mpsc::UnboundedSender<TaggedInbound>,
    ) -> Result<(), WorkerError> {
        self.require_primary("start")?;
        self.guard(WorkerState::Ready, "start")?;
        let spawned = backend.spawn(self.id)?;
        self.attach(spawned, inbound)
    }

    /// Adopt an already launched process and its channel.
    pub fn attach(
        &mut self,
        spawned: Spawned,
        inbound: mpsc::UnboundedSender<TaggedInbound>,
    ) -> Result<(), WorkerError> {
        self.guard(WorkerState::Ready, "start")?;
        let Spawned {
            mut process,
            channel,
        } = spawned;

        let (sink, mut received) = mpsc::unbounded_channel();
        if let Err(e) = channel.listen(sink) {
            let _ = process.kill();
            return Err(e.into());
        }

        let id = self.id;
        tokio::spawn(async move {
            while let Some(message) = received.recv().await {
                let terminal = message.is_terminal();
                if inbound.send((id, message)).is_err() || terminal {
                    break;
                }
            }
        });

        let pid = process.pid();
        let now = Instant::now();
        self.process = Some(process);
        self.channel = Some(channel);
        self.state = WorkerState::Started;
        self.started_at = Some(now);
        self.last_seen = Some(now);

        info!(worker_id = %id, pid = pid, "Worker started");
        self.events.emit(ClusterEvent::WorkerStart { worker_id: id, pid });
        Ok(())
    }

    /// Deliver `command` to the worker process.
    pub fn send(&self, command: &Command) -> Result<(), WorkerError> {
        self.guard(WorkerState::Started, "send")?;
        self.channel_ref()?.send(command)?;
        Ok(())
    }

    /// Ask the worker to prove it is alive. Primary only.
    pub fn heartbeat(&self) -> Result<(), WorkerError> {
        self.require_primary("heartbeat")?;
        self.guard(WorkerState::Started, "heartbeat")?;
        debug!(worker_id = %self.id, "Sending heartbeat");
        self.channel_ref()?.send(&Command::Heartbeat)?;
        Ok(())
    }

    /// Close the worker.
    ///
    /// Graceful close sends `Close` and waits for the process to exit on its
    /// own; forceful close kills it immediately.
    pub fn close(&mut self, graceful: bool) -> Result<(), WorkerError> {
        self.guard(WorkerState::Started, "close")?;
        if graceful {
            self.channel_ref()?.send(&Command::Close { graceful: true })?;
            self.state = WorkerState::Closing;
            self.closing_since = Some(Instant::now());
            info!(worker_id = %self.id, "Worker closing gracefully");
            Ok(())
        } else {
            self.kill()
        }
    }

    /// Forced termination from any live state.
    pub fn kill(&mut self) -> Result<(), WorkerError> {
        if !matches!(self.state, WorkerState::Started | WorkerState::Closing) {
            return Err(self.invalid_state("kill"));
        }
        if let Some(process) = self.process.as_mut() {
            process.kill()?;
        }
        warn!(worker_id = %self.id, pid = ?self.pid(), "Worker killed");
        self.state = WorkerState::Terminated;
        Ok(())
    }

    /// Whether a graceful close has been pending for longer than `timeout`.
    #[must_use]
    pub fn is_overdue(&self, timeout: Duration) -> bool {
        self.state == WorkerState::Closing
            && self.closing_since.is_some_and(|since| since.elapsed() > timeout)
    }

    /// Whether a started worker has not answered a heartbeat within `timeout`.
    #[must_use]
    pub fn is_unresponsive(&self, timeout: Duration) -> bool {
        self.state == WorkerState::Started
            && self.last_seen.is_some_and(|seen| seen.elapsed() > timeout)
    }

    /// Non-blocking exit check.
    pub fn try_reap(&mut self) -> Result<Option<ExitStatus>, WorkerError> {
        match self.process.as_mut() {
            Some(process) => Ok(process.try_wait()?),
            None => Ok(None),
        }
    }

    /// Record a confirmed process exit.
    pub fn mark_terminated(&mut self, status: ExitStatus) {
        let pid = self.pid().unwrap_or(0);
        self.state = WorkerState::Terminated;
        self.exit_status = Some(status);
        self.channel = None;

        info!(worker_id = %self.id, pid = pid, status = %status, "Worker exited");
        self.events.emit(ClusterEvent::WorkerClose {
            worker_id: self.id,
            pid,
            graceful: status.success(),
        });
    }

    /// React to a command received from this worker. Primary only.
    pub fn handle_command(&mut self, command: Command) -> Result<(), WorkerError> {
        self.require_primary("handle_command")?;
        self.events.emit(ClusterEvent::Command {
            worker_id: Some(self.id),
            command: command.clone(),
        });

        match command {
            Command::Ping { worker_id } if worker_id == self.id => {
                let at = self.touch();
                debug!(worker_id = %self.id, "Heartbeat answered");
                self.events.emit(ClusterEvent::Ping { worker_id, at });
            }
            Command::Ping { worker_id } => {
                warn!(worker_id = %self.id, claimed = %worker_id, "Ping carries another worker's id");
                self.events.emit(ClusterEvent::Error {
                    worker_id: Some(self.id),
                    message: format!("ping from worker {} claims id {worker_id}", self.id),
                });
            }
            Command::Pong => self.events.emit(ClusterEvent::Pong { worker_id: self.id }),
            Command::Message { text } => self.events.emit(ClusterEvent::Message {
                worker_id: self.id,
                text,
            }),
            Command::WorkerStatus { status, .. }
            | Command::Status {
                status: Some(status),
            } => self.events.emit(ClusterEvent::Status {
                worker_id: self.id,
                status,
            }),
            Command::Connections { connections } => self.events.emit(ClusterEvent::Connections {
                worker_id: self.id,
                connections,
            }),
            Command::Control { flags } => self.events.emit(ClusterEvent::Control {
                worker_id: self.id,
                flags,
            }),
            Command::Close { graceful } => {
                // Worker is retiring on its own
                if self.state == WorkerState::Started {
                    self.state = WorkerState::Closing;
                    self.closing_since = Some(Instant::now());
                }
                debug!(worker_id = %self.id, graceful = graceful, "Worker announced close");
            }
            Command::Nop
            | Command::Heartbeat
            | Command::Status { status: None }
            | Command::ConnectionsQuery { .. } => {
                debug!(worker_id = %self.id, command = %command.id(), "Ignoring worker-bound command");
            }
        }
        Ok(())
    }

    /// Forward an error frame to the worker, if its channel carries them.
    pub fn send_error(&self, message: &str) -> Result<(), WorkerError> {
        self.channel_ref()?.send_error(message)?;
        Ok(())
    }

    /// Bump `updated_at`; successive values are strictly increasing.
    fn touch(&mut self) -> DateTime<Utc> {
        let floor = self.updated_at + chrono::Duration::microseconds(1);
        self.updated_at = Utc::now().max(floor);
        self.last_seen = Some(Instant::now());
        self.updated_at
    }

    fn channel_ref(&self) -> Result<&dyn Channel, WorkerError> {
        self.channel
            .as_deref()
            .ok_or(WorkerError::Channel(ChannelError::Closed))
    }

    fn guard(&self, expected: WorkerState, operation: &'static str) -> Result<(), WorkerError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    const fn invalid_state(&self, operation: &'static str) -> WorkerError {
        WorkerError::InvalidState {
            id: self.id,
            operation,
            state: self.state,
        }
    }

    fn require_primary(&self, operation: &'static str) -> Result<(), WorkerError> {
        if self.role.is_primary() {
            Ok(())
        } else {
            Err(WorkerError::RoleViolation {
                operation,
                role: self.role,
            })
        }
    }
}

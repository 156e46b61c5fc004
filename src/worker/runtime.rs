// ABOUTME: Worker-side reactor answering control commands from the primary
//
// Runs the application's worker main next to the inbound channel listener.
// Heartbeats, status and connection queries are answered here; Close either
// drains the worker main (graceful, bounded) or drops it at once (forceful).
// Control flags reach the worker main through its handle.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::backend::RuntimeSettings;
use super::status::{memory_usage_bytes, ConnectionGuard, ConnectionTracker, WorkerStatus};
use super::{WorkerId, WorkerState};
use crate::channel::{Channel, Inbound};
use crate::command::{Command, ControlFlags};
use crate::events::{ClusterEvent, EventBus};

/// Application code run inside every worker process.
pub type WorkerMain = Arc<dyn Fn(WorkerHandle) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async function as a [`WorkerMain`].
pub fn worker_main<F, Fut>(f: F) -> WorkerMain
where
    F: Fn(WorkerHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |handle| f(handle).boxed())
}

/// Worker main that does nothing until asked to stop.
#[must_use]
pub fn idle_main() -> WorkerMain {
    worker_main(|mut handle: WorkerHandle| async move {
        handle.shutdown_requested().await;
        Ok(())
    })
}

/// What the worker main gets to talk to its runtime.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    shutdown: watch::Receiver<bool>,
    tracker: ConnectionTracker,
    events: EventBus,
    listening: Arc<Mutex<Option<String>>>,
    accept_paused: watch::Receiver<bool>,
    reloads: watch::Receiver<u64>,
}

impl WorkerHandle {
    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    #[must_use]
    pub const fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once a graceful close asks the worker main to wind down.
    pub async fn shutdown_requested(&mut self) {
        // An error means the runtime is gone, which is a stop request too
        let _ = self.shutdown.wait_for(|stop| *stop).await;
    }

    /// Whether the primary asked the worker to stop accepting connections.
    #[must_use]
    pub fn is_accept_paused(&self) -> bool {
        *self.accept_paused.borrow()
    }

    /// Resolves on the next `Control` command; returns whether accepting is
    /// now paused.
    pub async fn accept_pause_changed(&mut self) -> bool {
        if self.accept_paused.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        *self.accept_paused.borrow_and_update()
    }

    /// Resolves each time the primary sends the reload flag.
    pub async fn reload_requested(&mut self) {
        if self.reloads.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Address reported in status snapshots.
    pub fn set_listening_address(&self, address: impl Into<String>) {
        *self.listening.lock().unwrap_or_else(PoisonError::into_inner) = Some(address.into());
    }

    /// Register an accepted connection for status and connection queries.
    pub fn track_connection(&self, peer_address: String, local_address: String) -> ConnectionGuard {
        self.events.emit(ClusterEvent::Connection {
            worker_id: self.id,
            peer_address: peer_address.clone(),
        });
        self.tracker.track(peer_address, local_address)
    }
}

/// Why a worker runtime stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Close(graceful) received; the worker main was drained.
    Graceful,
    /// Close(forceful) received; the worker main was dropped.
    Forceful,
    /// The control channel to the primary broke.
    ChannelLost,
    /// The worker main returned on its own.
    Finished,
    /// The worker main or the channel setup failed.
    Failed,
}

impl Shutdown {
    #[must_use]
    pub const fn is_graceful(self) -> bool {
        matches!(self, Self::Graceful | Self::Finished)
    }

    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Failed => 1,
            _ => 0,
        }
    }
}

/// The reactor a worker process runs.
pub struct WorkerRuntime {
    id: WorkerId,
    channel: Box<dyn Channel>,
    settings: RuntimeSettings,
    main: WorkerMain,
    events: EventBus,
    tracker: ConnectionTracker,
    listening: Arc<Mutex<Option<String>>>,
    accept_paused: watch::Sender<bool>,
    reloads: watch::Sender<u64>,
    state: WorkerState,
}

impl WorkerRuntime {
    #[must_use]
    pub fn new(id: WorkerId, channel: Box<dyn Channel>, settings: RuntimeSettings, main: WorkerMain) -> Self {
        Self {
            id,
            channel,
            settings,
            main,
            events: EventBus::default(),
            tracker: ConnectionTracker::new(),
            listening: Arc::new(Mutex::new(None)),
            accept_paused: watch::channel(false).0,
            reloads: watch::channel(0).0,
            state: WorkerState::Ready,
        }
    }

    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    #[must_use]
    pub const fn state(&self) -> WorkerState {
        self.state
    }

    /// Serve the control channel until a close, then tear down.
    pub async fn run(mut self) -> Shutdown {
        let (sink, mut inbound) = mpsc::unbounded_channel();
        if let Err(e) = self.channel.listen(sink) {
            error!(worker_id = %self.id, error = %e, "Failed to listen on control channel");
            self.finish(Shutdown::Failed);
            return Shutdown::Failed;
        }

        self.state = WorkerState::Started;
        let pid = std::process::id();
        info!(worker_id = %self.id, pid = pid, "Worker runtime started");
        self.events.emit(ClusterEvent::Start { pid });

        let (stop, stop_rx) = watch::channel(false);
        let handle = WorkerHandle {
            id: self.id,
            shutdown: stop_rx,
            tracker: self.tracker.clone(),
            events: self.events.clone(),
            listening: Arc::clone(&self.listening),
            accept_paused: self.accept_paused.subscribe(),
            reloads: self.reloads.subscribe(),
        };
        let mut app = (self.main)(handle);

        let outcome = loop {
            tokio::select! {
                result = &mut app => {
                    break match result {
                        Ok(()) => {
                            info!(worker_id = %self.id, "Worker main finished");
                            Shutdown::Finished
                        }
                        Err(e) => {
                            error!(worker_id = %self.id, error = %e, "Worker main failed");
                            Shutdown::Failed
                        }
                    };
                }
                message = inbound.recv() => match message {
                    Some(Inbound::Command(command)) => {
                        if let Some(graceful) = self.handle_command(command) {
                            break if graceful { Shutdown::Graceful } else { Shutdown::Forceful };
                        }
                    }
                    Some(Inbound::Unsupported(e)) => {
                        warn!(worker_id = %self.id, error = %e, "Rejecting unsupported frame");
                        if let Err(e) = self.channel.send_error(&e.to_string()) {
                            debug!(error = %e, "Could not report unsupported frame");
                        }
                    }
                    Some(Inbound::RemoteError(message)) => {
                        warn!(worker_id = %self.id, message = %message, "Primary reported an error");
                        self.events.emit(ClusterEvent::Error {
                            worker_id: Some(self.id),
                            message,
                        });
                    }
                    Some(Inbound::Failed(e)) => {
                        error!(worker_id = %self.id, error = %e, "Control channel failed");
                        break Shutdown::ChannelLost;
                    }
                    Some(Inbound::Closed) | None => {
                        warn!(worker_id = %self.id, "Primary went away");
                        break Shutdown::ChannelLost;
                    }
                },
            }
        };

        if outcome == Shutdown::Graceful {
            let _ = stop.send(true);
            match tokio::time::timeout(self.settings.graceful_timeout, &mut app).await {
                Ok(Ok(())) => debug!(worker_id = %self.id, "Worker main drained"),
                Ok(Err(e)) => warn!(worker_id = %self.id, error = %e, "Worker main failed while draining"),
                Err(_) => warn!(
                    worker_id = %self.id,
                    timeout_ms = self.settings.graceful_timeout.as_millis(),
                    "Worker main did not drain in time"
                ),
            }
        }
        drop(app);

        self.finish(outcome);
        outcome
    }

    fn finish(&mut self, outcome: Shutdown) {
        self.state = WorkerState::Terminated;
        info!(worker_id = %self.id, outcome = ?outcome, "Worker runtime stopped");
        self.events.emit(ClusterEvent::Close {
            graceful: outcome.is_graceful(),
        });
    }

    /// Returns `Some(graceful)` when the command closes the worker.
    fn handle_command(&self, command: Command) -> Option<bool> {
        self.events.emit(ClusterEvent::Command {
            worker_id: Some(self.id),
            command: command.clone(),
        });

        match command {
            Command::Close { graceful } => {
                info!(worker_id = %self.id, graceful = graceful, "Close requested");
                return Some(graceful);
            }
            Command::Heartbeat => self.reply(&Command::Ping { worker_id: self.id }),
            Command::Ping { .. } => self.reply(&Command::Pong),
            Command::Pong => self.events.emit(ClusterEvent::Pong { worker_id: self.id }),
            Command::Status { status: None } => self.reply(&Command::WorkerStatus {
                worker_id: self.id,
                status: self.snapshot(),
            }),
            Command::Status {
                status: Some(status),
            } => self.events.emit(ClusterEvent::Status {
                worker_id: self.id,
                status,
            }),
            Command::ConnectionsQuery { .. } => self.reply(&Command::Connections {
                connections: self.tracker.snapshot(),
            }),
            Command::Message { text } => self.events.emit(ClusterEvent::Message {
                worker_id: self.id,
                text,
            }),
            Command::Control { flags } => {
                self.apply_control(flags);
                self.events.emit(ClusterEvent::Control {
                    worker_id: self.id,
                    flags,
                });
            }
            Command::Nop => {}
            Command::WorkerStatus { .. } | Command::Connections { .. } => {
                debug!(worker_id = %self.id, "Ignoring primary-bound reply");
            }
        }
        None
    }

    fn apply_control(&self, flags: ControlFlags) {
        let paused = flags.contains(ControlFlags::PAUSE_ACCEPT);
        if self.accept_paused.send_replace(paused) != paused {
            info!(worker_id = %self.id, paused = paused, "Accept state changed");
        }
        if flags.contains(ControlFlags::RELOAD) {
            self.reloads.send_modify(|generation| *generation += 1);
            info!(worker_id = %self.id, "Reload requested");
        }
    }

    fn reply(&self, command: &Command) {
        if let Err(e) = self.channel.send(command) {
            warn!(worker_id = %self.id, command = %command.id(), error = %e, "Failed to reply");
        }
    }

    fn snapshot(&self) -> WorkerStatus {
        WorkerStatus {
            pid: std::process::id(),
            listening_address: self
                .listening
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            memory_usage_bytes: memory_usage_bytes(),
            active_connections: self.tracker.len(),
        }
    }
}

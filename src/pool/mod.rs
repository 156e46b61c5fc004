// ABOUTME: Fixed-capacity pool of worker processes owned by the primary
// ABOUTME: Detects exits, restarts crashed workers with backoff and performs rolling restarts

//! Worker Pool
//!
//! The `WorkerPool` owns every `Worker` of the primary process:
//! - Start workers through the configured backend
//! - Reap exited workers and schedule replacements (steady state)
//! - Rolling restart: start a full new generation, then close the old one
//! - Heartbeats, liveness checks and escalation of stuck graceful closes
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                      WorkerPool                        │
//! │  workers: Vec<Worker>                                  │
//! │     - #4 pid 811 (started)                             │
//! │     - #5 pid 812 (started)                             │
//! │     - #2 pid 790 (closing)  -> killed after timeout    │
//! │                                                        │
//! │  inbound: (WorkerId, Inbound) <- every worker channel  │
//! │  backend: fork | subprocess                            │
//! └────────────────────────────────────────────────────────┘
//! ```

pub mod backoff;

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelError, Inbound};
use crate::cluster::Role;
use crate::command::Command;
use crate::events::{ClusterEvent, EventBus};
use crate::metrics::ClusterMetrics;
use crate::worker::{
    Backend, BackendKind, ExitStatus, Spawned, TaggedInbound, Worker, WorkerError, WorkerId, WorkerIds,
    WorkerState,
};

pub use backoff::CrashLoopBackoff;

// === Pool Errors ===

/// Errors that can occur during pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Error from an individual worker
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// No worker with this pid
    #[error("Unknown worker pid {0}")]
    UnknownWorker(u32),

    /// No worker with this id
    #[error("Unknown worker {0}")]
    UnknownWorkerId(WorkerId),

    /// Pools only exist in the primary process
    #[error("Worker pool cannot be created in the {0} process")]
    NotPrimary(Role),
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Supervision parameters for a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Number of started workers kept in steady state
    pub capacity: usize,
    /// Time a graceful close may take before the worker is killed
    pub graceful_timeout: Duration,
    /// Silence after which a started worker is considered hung
    pub heartbeat_timeout: Duration,
    /// Sleep between exit polls in a blocking `wait`
    pub poll_interval: Duration,
    /// Workers exiting sooner than this count as crash-looping
    pub min_uptime: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 1,
            graceful_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            min_uptime: Duration::from_secs(1),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// The primary's collection of workers.
#[derive(Debug)]
pub struct WorkerPool {
    settings: PoolSettings,
    backend: Backend,
    workers: Vec<Worker>,
    role: Role,
    events: EventBus,
    metrics: Arc<ClusterMetrics>,
    inbound_tx: mpsc::UnboundedSender<TaggedInbound>,
    inbound_rx: mpsc::UnboundedReceiver<TaggedInbound>,
    backoff: CrashLoopBackoff,
}

impl WorkerPool {
    /// Create an empty pool.
    ///
    /// # Errors
    /// Returns `NotPrimary` when called inside a worker process
    pub fn new(
        settings: PoolSettings,
        backend: Backend,
        role: Role,
        events: EventBus,
        metrics: Arc<ClusterMetrics>,
    ) -> PoolResult<Self> {
        if !role.is_primary() {
            return Err(PoolError::NotPrimary(role));
        }
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let backoff = CrashLoopBackoff::new(settings.min_uptime, settings.backoff_base, settings.backoff_max);

        Ok(Self {
            settings,
            backend,
            workers: Vec::new(),
            role,
            events,
            metrics,
            inbound_tx,
            inbound_rx,
            backoff,
        })
    }

    #[must_use]
    pub const fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.settings.capacity
    }

    #[must_use]
    pub const fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    #[must_use]
    pub const fn metrics(&self) -> &Arc<ClusterMetrics> {
        &self.metrics
    }

    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    #[must_use]
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    #[must_use]
    pub fn worker(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.iter().find(|w| w.id() == id)
    }

    #[must_use]
    pub fn worker_by_pid(&self, pid: u32) -> Option<&Worker> {
        self.workers.iter().find(|w| w.pid() == Some(pid))
    }

    /// Workers counting towards capacity.
    #[must_use]
    pub fn started_count(&self) -> usize {
        self.count(WorkerState::Started)
    }

    /// Workers whose process is not yet known to be gone.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state() != WorkerState::Terminated)
            .count()
    }

    /// Earliest time a crash-looping slot will be refilled.
    #[must_use]
    pub const fn next_restart_at(&self) -> Option<Instant> {
        self.backoff.hold_until()
    }

    fn count(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| w.state() == state).count()
    }

    fn position(&self, id: WorkerId) -> Option<usize> {
        self.workers.iter().position(|w| w.id() == id)
    }

    // === Lifecycle ===

    /// Launch a new worker with the given id.
    pub fn start(&mut self, id: WorkerId) -> PoolResult<&Worker> {
        let mut worker = Worker::new(id, self.role, self.events.clone());
        worker.start(&mut self.backend, self.inbound_tx.clone())?;
        Ok(self.push(worker))
    }

    /// Add a worker whose process was launched outside the backend.
    pub fn adopt(&mut self, id: WorkerId, spawned: Spawned) -> PoolResult<&Worker> {
        let mut worker = Worker::new(id, self.role, self.events.clone());
        worker.attach(spawned, self.inbound_tx.clone())?;
        Ok(self.push(worker))
    }

    fn push(&mut self, worker: Worker) -> &Worker {
        self.metrics.worker_started();
        let index = self.workers.len();
        self.workers.push(worker);
        &self.workers[index]
    }

    /// Next exited worker, removed from the pool and marked terminated.
    ///
    /// With `blocking`, polls every `poll_interval` until some worker exits
    /// or the pool is empty.
    pub async fn wait(&mut self, blocking: bool) -> Option<Worker> {
        loop {
            if let Some(worker) = self.reap_next() {
                return Some(worker);
            }
            if !blocking || self.workers.is_empty() {
                return None;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Every worker that has exited since the last call.
    pub fn reap(&mut self) -> Vec<Worker> {
        std::iter::from_fn(|| self.reap_next()).collect()
    }

    fn reap_next(&mut self) -> Option<Worker> {
        for index in 0..self.workers.len() {
            match self.workers[index].try_reap() {
                Ok(Some(status)) => return Some(self.retire(index, status)),
                Ok(None) => {}
                Err(e) => warn!(
                    worker_id = %self.workers[index].id(),
                    error = %e,
                    "Failed to poll worker exit"
                ),
            }
        }
        None
    }

    fn retire(&mut self, index: usize, status: ExitStatus) -> Worker {
        let mut worker = self.workers.remove(index);
        let crashed = worker.state() == WorkerState::Started;
        let uptime = worker.uptime().unwrap_or_default();

        self.backend.release(worker.id());
        worker.mark_terminated(status);
        self.metrics.worker_exited();

        if crashed {
            match self.backoff.record_crash(uptime, Instant::now()) {
                Some(hold) => warn!(
                    worker_id = %worker.id(),
                    uptime_ms = uptime.as_millis(),
                    hold_ms = hold.as_millis(),
                    streak = self.backoff.streak(),
                    "Worker crashed right after start, holding replacement"
                ),
                None => warn!(worker_id = %worker.id(), status = %status, "Worker exited unexpectedly"),
            }
        }
        worker
    }

    /// Start workers until `capacity` are started again.
    ///
    /// Returns how many were started; zero while a crash-loop backoff is pending.
    pub fn replenish(&mut self, ids: &mut WorkerIds) -> PoolResult<usize> {
        let deficit = self.capacity().saturating_sub(self.started_count());
        if deficit == 0 {
            return Ok(0);
        }
        if self.backoff.is_holding(Instant::now()) {
            debug!(deficit = deficit, "Replacement held back by crash loop");
            return Ok(0);
        }

        for _ in 0..deficit {
            let id = ids.next_id();
            self.start(id)?;
            self.metrics.worker_restarted();
            info!(worker_id = %id, "Replacement worker started");
        }
        Ok(deficit)
    }

    /// Rolling restart: start `capacity` new workers, then gracefully close
    /// every previously started one.
    ///
    /// Old workers are only closed once the whole new generation was launched.
    /// If a launch fails, the part of the new generation already running is
    /// killed and the old generation keeps serving at capacity. Old workers
    /// that ignore the close are killed by [`Self::escalate_overdue`].
    pub fn restart_all(&mut self, ids: &mut WorkerIds) -> PoolResult<Vec<WorkerId>> {
        self.restart_with(ids, |pool, id| pool.start(id).map(|_| ()))
    }

    fn restart_with(
        &mut self,
        ids: &mut WorkerIds,
        mut launch: impl FnMut(&mut Self, WorkerId) -> PoolResult<()>,
    ) -> PoolResult<Vec<WorkerId>> {
        let previous: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|w| w.state() == WorkerState::Started)
            .map(Worker::id)
            .collect();
        info!(previous = previous.len(), capacity = self.capacity(), "Rolling restart");

        let mut started = Vec::with_capacity(self.capacity());
        for _ in 0..self.capacity() {
            let id = ids.next_id();
            if let Err(e) = launch(self, id) {
                error!(worker_id = %id, error = %e, "Rolling restart aborted, keeping the running generation");
                self.abandon(&started);
                return Err(e);
            }
            started.push(id);
        }

        for id in previous {
            if let Some(index) = self.position(id) {
                if let Err(e) = self.workers[index].close(true) {
                    warn!(worker_id = %id, error = %e, "Failed to close old worker");
                }
            }
        }
        Ok(started)
    }

    /// Kill workers of an incomplete generation; they are reaped like any other.
    fn abandon(&mut self, ids: &[WorkerId]) {
        for &id in ids {
            let Some(index) = self.position(id) else {
                continue;
            };
            match self.workers[index].kill() {
                Ok(()) => self.metrics.worker_killed(),
                Err(e) => warn!(worker_id = %id, error = %e, "Failed to kill abandoned worker"),
            }
        }
    }

    /// Close every live worker. Returns how many were asked to close.
    pub fn close(&mut self, graceful: bool) -> usize {
        let mut closed = 0;
        for worker in &mut self.workers {
            let result = match worker.state() {
                WorkerState::Started => worker.close(graceful),
                WorkerState::Closing if !graceful => worker.kill(),
                _ => continue,
            };
            match result {
                Ok(()) => {
                    closed += 1;
                    if !graceful {
                        self.metrics.worker_killed();
                    }
                }
                Err(e) => warn!(worker_id = %worker.id(), error = %e, "Failed to close worker"),
            }
        }
        info!(graceful = graceful, closed = closed, "Pool close requested");
        closed
    }

    /// Close everything and wait until every process has been reaped.
    ///
    /// Graceful closes that exceed `graceful_timeout` are escalated to kills.
    pub async fn shutdown(&mut self, graceful: bool) -> Vec<Worker> {
        self.close(graceful);
        let mut exited = Vec::new();
        while !self.workers.is_empty() {
            exited.extend(self.reap());
            self.escalate_overdue();
            if self.workers.is_empty() {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
        exited
    }

    // === Control plane ===

    /// Send a heartbeat to the worker with `pid`.
    ///
    /// # Errors
    /// Returns `UnknownWorker` if no worker has this pid
    pub fn heartbeat(&mut self, pid: u32) -> PoolResult<()> {
        let worker = self
            .workers
            .iter()
            .find(|w| w.pid() == Some(pid))
            .ok_or(PoolError::UnknownWorker(pid))?;
        worker.heartbeat()?;
        self.metrics.command_sent();
        Ok(())
    }

    /// Heartbeat every started worker. Returns how many were reached.
    pub fn heartbeat_all(&mut self) -> usize {
        let mut sent = 0;
        for worker in self.workers.iter().filter(|w| w.state() == WorkerState::Started) {
            match worker.heartbeat() {
                Ok(()) => sent += 1,
                Err(e) => warn!(worker_id = %worker.id(), error = %e, "Heartbeat failed"),
            }
        }
        for _ in 0..sent {
            self.metrics.command_sent();
        }
        sent
    }

    /// Send `command` to one worker.
    pub fn send(&self, id: WorkerId, command: &Command) -> PoolResult<()> {
        let index = self.position(id).ok_or(PoolError::UnknownWorkerId(id))?;
        self.workers[index].send(command)?;
        self.metrics.command_sent();
        Ok(())
    }

    /// Send `command` to every started worker. Returns how many were reached.
    pub fn broadcast(&self, command: &Command) -> usize {
        let mut sent = 0;
        for worker in self.workers.iter().filter(|w| w.state() == WorkerState::Started) {
            match worker.send(command) {
                Ok(()) => {
                    sent += 1;
                    self.metrics.command_sent();
                }
                Err(e) => warn!(worker_id = %worker.id(), error = %e, "Broadcast failed"),
            }
        }
        sent
    }

    /// Next message from any worker channel.
    pub async fn recv_inbound(&mut self) -> Option<TaggedInbound> {
        self.inbound_rx.recv().await
    }

    /// Apply a message received from worker `id`.
    pub fn dispatch(&mut self, id: WorkerId, inbound: Inbound) {
        let Some(index) = self.position(id) else {
            debug!(worker_id = %id, "Dropping message from retired worker");
            return;
        };

        match inbound {
            Inbound::Command(command) => {
                self.metrics.command_received();
                if let Err(e) = self.workers[index].handle_command(command) {
                    warn!(worker_id = %id, error = %e, "Failed to handle worker command");
                }
            }
            Inbound::RemoteError(message) => {
                warn!(worker_id = %id, message = %message, "Worker reported an error");
                self.events.emit(ClusterEvent::Error {
                    worker_id: Some(id),
                    message,
                });
            }
            Inbound::Unsupported(e) => {
                warn!(worker_id = %id, error = %e, "Worker sent an unsupported frame");
                let message = e.to_string();
                if let Err(e) = self.workers[index].send_error(&message) {
                    debug!(worker_id = %id, error = %e, "Could not report unsupported frame");
                }
                self.events.emit(ClusterEvent::Error {
                    worker_id: Some(id),
                    message,
                });
            }
            Inbound::Failed(e) => {
                if matches!(e, ChannelError::Protocol(_)) {
                    self.metrics.protocol_error();
                }
                error!(worker_id = %id, error = %e, "Worker channel failed, killing worker");
                self.events.emit(ClusterEvent::Error {
                    worker_id: Some(id),
                    message: e.to_string(),
                });
                let worker = &mut self.workers[index];
                if matches!(worker.state(), WorkerState::Started | WorkerState::Closing) {
                    match worker.kill() {
                        Ok(()) => self.metrics.worker_killed(),
                        Err(e) => warn!(worker_id = %id, error = %e, "Failed to kill worker"),
                    }
                }
            }
            Inbound::Closed => debug!(worker_id = %id, "Worker channel closed"),
        }
    }

    // === Supervision ===

    /// Kill workers whose graceful close exceeded `graceful_timeout`.
    pub fn escalate_overdue(&mut self) -> usize {
        let timeout = self.settings.graceful_timeout;
        let mut killed = 0;
        for worker in self.workers.iter_mut().filter(|w| w.is_overdue(timeout)) {
            warn!(
                worker_id = %worker.id(),
                timeout_ms = timeout.as_millis(),
                "Graceful close timed out, killing worker"
            );
            match worker.kill() {
                Ok(()) => {
                    killed += 1;
                    self.metrics.worker_killed();
                }
                Err(e) => warn!(worker_id = %worker.id(), error = %e, "Failed to kill worker"),
            }
        }
        killed
    }

    /// Kill started workers that stopped answering heartbeats.
    pub fn check_liveness(&mut self) -> usize {
        let timeout = self.settings.heartbeat_timeout;
        let mut killed = 0;
        for worker in self.workers.iter_mut().filter(|w| w.is_unresponsive(timeout)) {
            warn!(
                worker_id = %worker.id(),
                timeout_ms = timeout.as_millis(),
                "Worker missed heartbeats, killing it"
            );
            match worker.kill() {
                Ok(()) => {
                    killed += 1;
                    self.metrics.worker_killed();
                }
                Err(e) => warn!(worker_id = %worker.id(), error = %e, "Failed to kill worker"),
            }
        }
        killed
    }
}

// ABOUTME: Top-level cluster: role detection, the primary's pool and its supervision loop
// ABOUTME: Forks workers, shares the listen address and keeps capacity steady until shutdown

//! Cluster
//!
//! One `Cluster` exists in the primary process. It owns the `WorkerPool` and
//! drives it from a single reactor:
//!
//! ```text
//! ┌──────────────────────────── Cluster::run ───────────────────────────┐
//! │  poll tick       -> reap exits, escalate closes, liveness, refill   │
//! │  heartbeat tick  -> Heartbeat to every started worker               │
//! │  worker inbound  -> Pool::dispatch (ping, status, errors, ...)      │
//! │  SIGHUP          -> rolling restart                                 │
//! │  SIGTERM/SIGINT  -> graceful shutdown (twice: forceful)             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Worker processes never build a `Cluster`; they run a `WorkerRuntime`
//! entered from the backend.

pub mod context;
pub mod listen;

use std::net::SocketAddr;
use std::sync::Arc;

use nix::sys::signal::Signal;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::channel::SignalListener;
use crate::command::Command;
use crate::config::{ClusterConfig, ConfigError};
use crate::events::{ClusterEvent, EventBus};
use crate::metrics::ClusterMetrics;
use crate::pool::{PoolError, WorkerPool};
use crate::worker::runtime::WorkerMain;
use crate::worker::{Backend, Worker, WorkerError, WorkerId, WorkerIds};

pub use context::{ClusterContext, Role, ROLE_ENV};
pub use listen::{SharedAddress, LISTEN_ENV};

/// Errors raised by the cluster
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Operation reserved to the primary process
    #[error("{operation} is only available in the primary process, not in {role}")]
    NotPrimary { operation: &'static str, role: Role },

    #[error("Invalid cluster configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// The shared address could not be reserved
    #[error("Failed to listen on {address}: {source}")]
    Listen {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Signal handlers could not be installed
    #[error("Failed to install signal handlers: {0}")]
    Signal(#[source] std::io::Error),
}

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// The primary's view of the whole cluster.
#[derive(Debug)]
pub struct Cluster {
    context: ClusterContext,
    config: ClusterConfig,
    pool: WorkerPool,
    ids: WorkerIds,
    events: EventBus,
    metrics: Arc<ClusterMetrics>,
    address: Option<SocketAddr>,
    // Keeps the port pinned while workers come and go
    _reservation: Option<SharedAddress>,
    shutting_down: bool,
}

impl Cluster {
    /// Build the primary's cluster; every worker will run `main`.
    ///
    /// # Errors
    /// Fails in a worker process, on invalid configuration, or when the
    /// backend cannot be prepared.
    pub fn new(context: ClusterContext, config: ClusterConfig, main: WorkerMain) -> ClusterResult<Self> {
        if !context.is_primary() {
            return Err(ClusterError::NotPrimary {
                operation: "Cluster::new",
                role: context.role(),
            });
        }
        config.validate()?;

        let events = EventBus::default();
        let metrics = Arc::new(ClusterMetrics::new());
        let backend = Backend::new(config.backend, config.runtime_settings(), main)?;
        let pool = WorkerPool::new(
            config.pool_settings(),
            backend,
            context.role(),
            events.clone(),
            Arc::clone(&metrics),
        )?;

        info!(
            workers = config.workers,
            backend = %pool.backend_kind(),
            "Cluster created"
        );

        Ok(Self {
            context,
            config,
            pool,
            ids: WorkerIds::new(),
            events,
            metrics,
            address: None,
            _reservation: None,
            shutting_down: false,
        })
    }

    #[must_use]
    pub const fn context(&self) -> &ClusterContext {
        &self.context
    }

    #[must_use]
    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    #[must_use]
    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut WorkerPool {
        &mut self.pool
    }

    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub const fn metrics(&self) -> &Arc<ClusterMetrics> {
        &self.metrics
    }

    /// Address workers share, once [`Self::listen`] was called.
    #[must_use]
    pub const fn listen_address(&self) -> Option<SocketAddr> {
        self.address
    }

    #[must_use]
    pub const fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    // === Workers ===

    /// Start one more worker with the next id.
    pub fn fork(&mut self) -> ClusterResult<WorkerId> {
        let id = self.ids.next_id();
        let pid = self.pool.start(id)?.pid();
        debug!(worker_id = %id, pid = ?pid, "Forked worker");
        Ok(id)
    }

    /// Fork workers until the pool is at capacity. Returns how many were started.
    pub fn start(&mut self) -> ClusterResult<usize> {
        let missing = self.pool.capacity().saturating_sub(self.pool.started_count());
        for _ in 0..missing {
            self.fork()?;
        }
        self.events.emit(ClusterEvent::Start {
            pid: std::process::id(),
        });
        info!(started = missing, capacity = self.pool.capacity(), "Cluster started");
        Ok(missing)
    }

    /// Reserve the shared address every worker binds to.
    ///
    /// Workers learn the address from their environment at launch, so
    /// workers already running are replaced by a rolling restart that
    /// inherits it. Port reuse is enabled when several workers share the
    /// address. Returns the resolved address (port 0 becomes a concrete port).
    pub fn listen(&mut self, address: SocketAddr) -> ClusterResult<SocketAddr> {
        let reuse_port = self.config.shares_port();
        let shared = SharedAddress::reserve(address, reuse_port)
            .map_err(|source| ClusterError::Listen { address, source })?;
        shared.export();

        let resolved = shared.address();
        info!(address = %resolved, reuse_port = reuse_port, "Shared listen address reserved");
        self.address = Some(resolved);
        // Without SO_REUSEPORT the worker must be the only socket on the port
        self._reservation = reuse_port.then_some(shared);

        if self.pool.started_count() > 0 {
            info!(
                running = self.pool.started_count(),
                "Restarting running workers onto the shared address"
            );
            self.reload()?;
        }
        Ok(resolved)
    }

    /// Send `command` to one worker.
    pub fn send(&self, id: WorkerId, command: &Command) -> ClusterResult<()> {
        Ok(self.pool.send(id, command)?)
    }

    /// Send `command` to every started worker.
    pub fn broadcast(&self, command: &Command) -> usize {
        self.pool.broadcast(command)
    }

    /// Rolling restart of every worker.
    pub fn reload(&mut self) -> ClusterResult<Vec<WorkerId>> {
        Ok(self.pool.restart_all(&mut self.ids)?)
    }

    // === Supervision ===

    /// One supervision pass: reap exited workers, kill overdue or silent
    /// ones and, unless shutting down, start replacements.
    ///
    /// Returns the workers reaped during this pass.
    pub fn tick(&mut self) -> ClusterResult<Vec<Worker>> {
        let exited = self.pool.reap();
        for worker in &exited {
            info!(
                worker_id = %worker.id(),
                pid = ?worker.pid(),
                status = ?worker.exit_status(),
                "Worker exited"
            );
        }

        self.pool.escalate_overdue();
        self.pool.check_liveness();

        if !self.shutting_down {
            let started = self.pool.replenish(&mut self.ids)?;
            if started > 0 {
                info!(started = started, "Restored pool capacity");
            }
        }
        Ok(exited)
    }

    /// Boot the workers and supervise them until SIGTERM or SIGINT.
    ///
    /// SIGHUP triggers a rolling restart. A second SIGTERM/SIGINT during the
    /// graceful shutdown kills the remaining workers.
    pub async fn run(&mut self) -> ClusterResult<()> {
        let mut signals = SignalListener::install(&[Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP])
            .map_err(ClusterError::Signal)?;
        self.start()?;

        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.tick() {
                        error!(error = %e, "Supervision pass failed");
                    }
                }
                _ = heartbeat.tick() => {
                    let sent = self.pool.heartbeat_all();
                    debug!(sent = sent, "Heartbeat round");
                }
                Some((id, inbound)) = self.pool.recv_inbound() => {
                    self.pool.dispatch(id, inbound);
                }
                signal = signals.recv() => match signal {
                    Some(Signal::SIGHUP) => {
                        info!("SIGHUP received, reloading workers");
                        if let Err(e) = self.reload() {
                            error!(error = %e, "Rolling restart failed");
                        }
                    }
                    Some(signal) => {
                        info!(signal = %signal, "Shutting down gracefully");
                        break;
                    }
                    None => {
                        warn!("Signal listener closed, shutting down");
                        break;
                    }
                },
            }
        }

        let graceful = self.drain(&mut signals, &mut poll).await;
        self.finish(graceful);
        Ok(())
    }

    /// Close every worker and wait for all of them to exit.
    pub async fn shutdown(&mut self, graceful: bool) -> Vec<Worker> {
        self.shutting_down = true;
        let exited = self.pool.shutdown(graceful).await;
        self.finish(graceful);
        exited
    }

    async fn drain(&mut self, signals: &mut SignalListener, poll: &mut tokio::time::Interval) -> bool {
        self.shutting_down = true;
        let mut graceful = true;
        self.pool.close(true);

        while !self.pool.is_empty() {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.tick() {
                        error!(error = %e, "Supervision pass failed");
                    }
                }
                Some((id, inbound)) = self.pool.recv_inbound() => {
                    self.pool.dispatch(id, inbound);
                }
                Some(signal) = signals.recv(), if graceful => {
                    if signal != Signal::SIGHUP {
                        warn!(signal = %signal, "Second stop signal, killing workers");
                        graceful = false;
                        self.pool.close(false);
                    }
                }
            }
        }
        graceful
    }

    fn finish(&self, graceful: bool) {
        let snapshot = self.metrics.snapshot();
        info!(
            graceful = graceful,
            workers_started = snapshot.workers_started,
            workers_exited = snapshot.workers_exited,
            restarts = snapshot.restarts,
            forced_kills = snapshot.forced_kills,
            commands_sent = snapshot.commands_sent,
            commands_received = snapshot.commands_received,
            protocol_errors = snapshot.protocol_errors,
            "Cluster stopped"
        );
        self.events.emit(ClusterEvent::Close { graceful });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::runtime::idle_main;
    use crate::worker::BackendKind;

    fn config(workers: usize) -> ClusterConfig {
        ClusterConfig {
            workers,
            backend: BackendKind::Fork,
            ..ClusterConfig::default()
        }
    }

    #[test]
    fn test_cluster_refuses_worker_role() {
        let context = ClusterContext::with_role(Role::Worker(WorkerId(2)));
        let err = Cluster::new(context, config(1), idle_main()).unwrap_err();
        assert!(matches!(err, ClusterError::NotPrimary { .. }));
        assert!(err.to_string().contains("worker 2"));
    }

    #[test]
    fn test_cluster_rejects_invalid_config() {
        let err = Cluster::new(ClusterContext::primary(), config(0), idle_main()).unwrap_err();
        assert!(matches!(err, ClusterError::Config(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    #[serial_test::serial(listen_env)]
    async fn test_listen_resolves_port_and_exports_it() {
        let mut cluster = Cluster::new(ClusterContext::primary(), config(2), idle_main()).unwrap();
        let address = cluster.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        assert_ne!(address.port(), 0);
        assert_eq!(cluster.listen_address(), Some(address));
        assert_eq!(listen::shared_address(), Some(address));

        // Workers can bind the same port next to the reservation
        let worker_socket = listen::bind(address, true).unwrap();
        assert_eq!(worker_socket.local_addr().unwrap(), address);
    }

    #[tokio::test]
    async fn test_tick_on_empty_cluster_is_quiet_while_shutting_down() {
        let mut cluster = Cluster::new(ClusterContext::primary(), config(1), idle_main()).unwrap();
        let exited = cluster.shutdown(true).await;
        assert!(exited.is_empty());
        assert!(cluster.is_shutting_down());

        // No replacements are started once shutdown began
        assert!(cluster.tick().unwrap().is_empty());
        assert!(cluster.pool().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_emits_close_event() {
        let mut cluster = Cluster::new(ClusterContext::primary(), config(1), idle_main()).unwrap();
        let mut events = cluster.subscribe();
        cluster.shutdown(false).await;
        assert_eq!(events.recv().await.unwrap(), ClusterEvent::Close { graceful: false });
    }
}

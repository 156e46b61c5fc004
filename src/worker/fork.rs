// ABOUTME: Fork backend duplicating the primary into worker processes
//
// A socketpair is created before fork(2); the primary keeps one end, the child
// the other. The child never returns into the primary's code: it drops the
// signal actions it inherited, closes the primary-side ends of its siblings'
// channels, runs its own single-threaded runtime on a fresh thread and exits
// the process.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;

use nix::unistd::{fork, setpgid, ForkResult, Pid};
use tokio::net::UnixStream;
use tracing::{debug, error, info_span, Instrument};

use super::backend::{ProcessHandle, RuntimeSettings, Spawned};
use super::runtime::{WorkerMain, WorkerRuntime};
use super::{WorkerError, WorkerId};
use crate::channel::signal::SignalBlock;
use crate::channel::{DelegatingChannel, SignalChannel, StreamChannel};
use crate::cluster::ROLE_ENV;
use crate::command::CommandFactory;

/// Forks the running primary.
pub struct ForkBackend {
    settings: RuntimeSettings,
    main: WorkerMain,
    factory: Arc<CommandFactory>,
    /// Primary-side channel fds of live workers; closed in every new child.
    parent_fds: HashMap<WorkerId, RawFd>,
}

impl std::fmt::Debug for ForkBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkBackend")
            .field("settings", &self.settings)
            .field("parent_fds", &self.parent_fds)
            .finish_non_exhaustive()
    }
}

impl ForkBackend {
    #[must_use]
    pub fn new(settings: RuntimeSettings, main: WorkerMain) -> Self {
        Self {
            settings,
            main,
            factory: Arc::new(CommandFactory::standard()),
            parent_fds: HashMap::new(),
        }
    }

    pub fn spawn(&mut self, id: WorkerId) -> Result<Spawned, WorkerError> {
        let (parent_end, child_end) = StdUnixStream::pair().map_err(WorkerError::Spawn)?;
        let block = SignalBlock::managed().map_err(WorkerError::Spawn)?;

        // SAFETY: the primary runs a current-thread runtime, so no other
        // thread can hold a lock across the fork; the child diverges below.
        let fork_result = unsafe { fork() }.map_err(|e| WorkerError::Spawn(e.into()))?;

        match fork_result {
            ForkResult::Child => {
                // Stays blocked until the worker's signal listener is installed
                std::mem::forget(block);
                drop(parent_end);
                let code = self.run_child(id, child_end);
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                drop(block);
                drop(child_end);
                self.adopt(id, child, parent_end)
            }
        }
    }

    pub fn release(&mut self, id: WorkerId) {
        self.parent_fds.remove(&id);
    }

    fn adopt(&mut self, id: WorkerId, pid: Pid, parent_end: StdUnixStream) -> Result<Spawned, WorkerError> {
        let process = ProcessHandle::Forked { pid };
        let stream = match into_tokio(parent_end) {
            Ok(stream) => stream,
            Err(e) => {
                let mut process = process;
                let _ = process.kill();
                return Err(e.into());
            }
        };
        self.parent_fds.insert(id, stream.as_raw_fd());

        let (reader, writer) = stream.into_split();
        let stream = StreamChannel::new(format!("worker-{id}"), reader, writer, Arc::clone(&self.factory))
            .with_max_payload(self.settings.max_payload);
        // Close commands go out as signals, everything else over the stream
        let channel = DelegatingChannel::default()
            .with(SignalChannel::outbound(pid))
            .with(stream);

        debug!(worker_id = %id, pid = pid.as_raw(), "Forked worker process");
        Ok(Spawned {
            process,
            channel: Box::new(channel),
        })
    }

    /// Child side of the fork; returns the process exit code.
    fn run_child(&self, id: WorkerId, child_end: StdUnixStream) -> i32 {
        crate::channel::signal::unregister_inherited();
        for fd in self.parent_fds.values() {
            let _ = nix::unistd::close(*fd);
        }
        std::env::set_var(ROLE_ENV, id.to_string());
        // Keep terminal job-control signals aimed at the primary only
        let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));

        let settings = self.settings;
        let main = Arc::clone(&self.main);
        let factory = Arc::clone(&self.factory);

        let thread = std::thread::Builder::new()
            .name(format!("prefork-worker-{id}"))
            .spawn(move || run_child_runtime(id, child_end, settings, main, factory));

        match thread {
            Ok(handle) => handle.join().unwrap_or(1),
            Err(e) => {
                error!(worker_id = %id, error = %e, "Failed to start worker thread");
                1
            }
        }
    }
}

fn into_tokio(stream: StdUnixStream) -> std::io::Result<UnixStream> {
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

fn run_child_runtime(
    id: WorkerId,
    child_end: StdUnixStream,
    settings: RuntimeSettings,
    main: WorkerMain,
    factory: Arc<CommandFactory>,
) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(worker_id = %id, error = %e, "Failed to build worker runtime");
            return 1;
        }
    };

    runtime.block_on(
        async move {
            let stream = match into_tokio(child_end) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "Failed to adopt control channel");
                    return 1;
                }
            };
            let (reader, writer) = stream.into_split();
            let stream = StreamChannel::new("primary", reader, writer, factory)
                .with_max_payload(settings.max_payload);
            let channel = DelegatingChannel::default()
                .with(SignalChannel::inbound())
                .with(stream);

            let shutdown = WorkerRuntime::new(id, Box::new(channel), settings, main)
                .run()
                .await;
            shutdown.exit_code()
        }
        .instrument(info_span!("worker", id = %id)),
    )
}

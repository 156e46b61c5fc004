// ABOUTME: Subprocess backend re-executing the binary as a worker process
//
// The child gets ROLE_ENV set to its worker id and talks to the primary over
// its stdin/stdout; stderr is inherited so worker logs reach the terminal.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, info_span, Instrument};

use super::backend::{ProcessHandle, RuntimeSettings, Spawned};
use super::runtime::{WorkerMain, WorkerRuntime};
use super::{WorkerError, WorkerId};
use crate::channel::{DelegatingChannel, SignalChannel, StreamChannel};
use crate::cluster::ROLE_ENV;
use crate::command::CommandFactory;

/// Launches workers as fresh processes.
#[derive(Debug)]
pub struct SubprocessBackend {
    program: PathBuf,
    args: Vec<String>,
    settings: RuntimeSettings,
    factory: Arc<CommandFactory>,
}

impl SubprocessBackend {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, settings: RuntimeSettings) -> Self {
        Self {
            program: program.into(),
            args,
            settings,
            factory: Arc::new(CommandFactory::standard()),
        }
    }

    /// Re-run the current executable with the current arguments.
    pub fn current_exe(settings: RuntimeSettings) -> Result<Self, WorkerError> {
        let program = std::env::current_exe().map_err(WorkerError::Spawn)?;
        Ok(Self::new(program, std::env::args().skip(1).collect(), settings))
    }

    pub fn spawn(&mut self, id: WorkerId) -> Result<Spawned, WorkerError> {
        debug!(worker_id = %id, program = %self.program.display(), args = ?self.args, "Spawning worker process");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(ROLE_ENV, id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;

        let missing = |what: &str| {
            WorkerError::Spawn(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("worker {what} was not captured"),
            ))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        let channel = StreamChannel::new(format!("worker-{id}"), stdout, stdin, Arc::clone(&self.factory))
            .with_max_payload(self.settings.max_payload);

        Ok(Spawned {
            process: ProcessHandle::from_child(child)?,
            channel: Box::new(channel),
        })
    }
}

/// Entry point of a subprocess worker: serve the control channel on stdio.
///
/// Returns the process exit code.
pub async fn run_worker(id: WorkerId, settings: RuntimeSettings, main: WorkerMain) -> i32 {
    let stream = StreamChannel::new(
        "primary",
        tokio::io::stdin(),
        tokio::io::stdout(),
        Arc::new(CommandFactory::standard()),
    )
    .with_max_payload(settings.max_payload);
    let channel = DelegatingChannel::default()
        .with(SignalChannel::inbound())
        .with(stream);

    WorkerRuntime::new(id, Box::new(channel), settings, main)
        .run()
        .instrument(info_span!("worker", id = %id))
        .await
        .exit_code()
}

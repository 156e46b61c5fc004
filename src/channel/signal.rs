// ABOUTME: Signal channel mapping commands onto POSIX signals
//
// Outbound channels deliver a command by signalling a peer pid. Inbound
// channels translate signals received by this process back into commands.
// Each signal is registered with signal-hook against its own socketpair, read
// by a tokio task; the tokio signal driver is not used, so the mechanism
// survives fork.

use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use nix::libc::c_int;
use nix::sys::signal::{self, kill, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;
use signal_hook::consts::FORBIDDEN;
use signal_hook::low_level::{pipe, unregister};
use signal_hook::SigId;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Channel, ChannelError, Inbound, InboundSender};
use crate::command::Command;

/// Registrations made by this process, inherited by forked children.
static INSTALLED: Mutex<Vec<(Signal, SigId)>> = Mutex::new(Vec::new());

/// Signals a prefork process ever installs handlers for.
const MANAGED_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP];

fn installed() -> std::sync::MutexGuard<'static, Vec<(Signal, SigId)>> {
    INSTALLED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receives selected signals for this process as an async stream.
///
/// Dropping the listener unregisters its actions. signal-hook keeps its
/// handler in place afterwards, so the signals are then discarded rather than
/// taking their default action.
#[derive(Debug)]
pub struct SignalListener {
    registered: Vec<(Signal, SigId)>,
    readers: Vec<JoinHandle<()>>,
    rx: mpsc::UnboundedReceiver<Signal>,
}

impl SignalListener {
    /// Route `signals` to this listener. Must be called within a tokio runtime.
    ///
    /// Either every signal is registered or none is.
    pub fn install(signals: &[Signal]) -> std::io::Result<Self> {
        if let Some(sig) = signals.iter().find(|sig| FORBIDDEN.contains(&(**sig as c_int))) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{sig} cannot be handled"),
            ));
        }

        // All fallible setup happens before the first registration
        let mut pipes = Vec::with_capacity(signals.len());
        for &sig in signals {
            let (reader, writer) = StdUnixStream::pair()?;
            reader.set_nonblocking(true)?;
            writer.set_nonblocking(true)?;
            pipes.push((sig, UnixStream::from_std(reader)?, writer));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut listener = Self {
            registered: Vec::with_capacity(signals.len()),
            readers: Vec::with_capacity(signals.len()),
            rx,
        };
        for (sig, reader, writer) in pipes {
            // On error the partial listener drops and unregisters the rest
            let id = pipe::register(sig as c_int, writer)?;
            listener.registered.push((sig, id));
            installed().push((sig, id));
            listener.readers.push(tokio::spawn(forward(sig, reader, tx.clone())));
        }

        // Signals held back across fork are delivered from here on
        signal_set(signals).thread_unblock()?;
        debug!(signals = ?signals, "Signal listener installed");
        Ok(listener)
    }

    /// Next received signal; `None` once every reader has stopped.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        let mut installed = installed();
        for (sig, id) in self.registered.drain(..) {
            unregister(id);
            installed.retain(|(_, other)| *other != id);
            debug!(signal = %sig, "Signal action unregistered");
        }
        for reader in &self.readers {
            reader.abort();
        }
    }
}

async fn forward(sig: Signal, mut reader: UnixStream, tx: mpsc::UnboundedSender<Signal>) {
    let mut buf = [0u8; 16];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                for _ in 0..n {
                    if tx.send(sig).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn signal_set(signals: &[Signal]) -> SigSet {
    let mut set = SigSet::empty();
    for &sig in signals {
        set.add(sig);
    }
    set
}

/// Keeps the managed signals blocked on the calling thread while alive.
///
/// Held across fork(2): the child inherits the blocked mask, so a signal sent
/// before its listener exists stays pending instead of killing it.
#[derive(Debug)]
pub struct SignalBlock {
    previous: SigSet,
}

impl SignalBlock {
    pub fn managed() -> std::io::Result<Self> {
        let mut previous = SigSet::empty();
        signal::pthread_sigmask(
            SigmaskHow::SIG_BLOCK,
            Some(&signal_set(&MANAGED_SIGNALS)),
            Some(&mut previous),
        )?;
        Ok(Self { previous })
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        if let Err(e) = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            warn!(error = %e, "Failed to restore signal mask");
        }
    }
}

/// Unregister the actions a forked child inherited from the primary, so its
/// signals never land in the primary's pipes.
///
/// Called first thing in a freshly forked child.
pub fn unregister_inherited() {
    for (sig, id) in installed().drain(..) {
        unregister(id);
        debug!(signal = %sig, "Inherited signal action unregistered");
    }
}

/// Channel carrying commands as signals.
#[derive(Debug)]
pub struct SignalChannel {
    peer: Option<Pid>,
    routes: Vec<(Signal, Command)>,
    listening: AtomicBool,
}

impl SignalChannel {
    /// Default mapping: SIGTERM closes gracefully, SIGINT closes forcefully.
    #[must_use]
    pub fn standard_routes() -> Vec<(Signal, Command)> {
        vec![
            (Signal::SIGTERM, Command::Close { graceful: true }),
            (Signal::SIGINT, Command::Close { graceful: false }),
        ]
    }

    /// Send-only channel signalling `peer`.
    #[must_use]
    pub fn outbound(peer: Pid) -> Self {
        Self {
            peer: Some(peer),
            routes: Self::standard_routes(),
            listening: AtomicBool::new(false),
        }
    }

    /// Receive-only channel for signals sent to this process.
    #[must_use]
    pub fn inbound() -> Self {
        Self {
            peer: None,
            routes: Self::standard_routes(),
            listening: AtomicBool::new(false),
        }
    }

    /// Add or replace the route for `signal`.
    #[must_use]
    pub fn with_route(mut self, signal: Signal, command: Command) -> Self {
        self.routes.retain(|(s, _)| *s != signal);
        self.routes.push((signal, command));
        self
    }

    fn signal_for(&self, command: &Command) -> Option<Signal> {
        self.routes
            .iter()
            .find(|(_, routed)| routed.key() == command.key())
            .map(|(sig, _)| *sig)
    }

    fn command_for(routes: &[(Signal, Command)], signal: Signal) -> Option<Command> {
        routes
            .iter()
            .find(|(sig, _)| *sig == signal)
            .map(|(_, command)| command.clone())
    }
}

impl Channel for SignalChannel {
    fn supports(&self, command: &Command) -> bool {
        self.peer.is_some() && self.signal_for(command).is_some()
    }

    fn send(&self, command: &Command) -> Result<(), ChannelError> {
        let (Some(peer), Some(sig)) = (self.peer, self.signal_for(command)) else {
            return Err(ChannelError::NoRoute(command.id()));
        };
        debug!(pid = peer.as_raw(), signal = %sig, command = %command.id(), "Delivering command as signal");
        kill(peer, sig).map_err(|e| ChannelError::Signal(format!("{sig} to {peer}: {e}")))
    }

    fn listen(&self, sink: InboundSender) -> Result<(), ChannelError> {
        // Signals arrive at this process, never from the peer
        if self.peer.is_some() {
            return Ok(());
        }
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::AlreadyListening);
        }

        let signals: Vec<Signal> = self.routes.iter().map(|(sig, _)| *sig).collect();
        let mut listener = SignalListener::install(&signals)?;
        let routes = self.routes.clone();

        tokio::spawn(async move {
            while let Some(sig) = listener.recv().await {
                let Some(command) = Self::command_for(&routes, sig) else {
                    continue;
                };
                debug!(signal = %sig, command = %command.id(), "Received command as signal");
                if sink.send(Inbound::Command(command)).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn installed_signals() -> Vec<Signal> {
        installed().iter().map(|(sig, _)| *sig).collect()
    }

    // ==================== Listener Tests ====================

    #[tokio::test]
    async fn test_install_rejects_forbidden_signal_without_registering_others() {
        let result = SignalListener::install(&[Signal::SIGUSR1, Signal::SIGKILL]);
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::InvalidInput);
        assert!(!installed_signals().contains(&Signal::SIGUSR1));
    }

    #[tokio::test]
    async fn test_dropping_listener_unregisters_its_actions() {
        let listener = SignalListener::install(&[Signal::SIGWINCH]).unwrap();
        assert!(installed_signals().contains(&Signal::SIGWINCH));
        drop(listener);
        assert!(!installed_signals().contains(&Signal::SIGWINCH));
    }

    #[tokio::test]
    async fn test_listener_reports_each_signal_separately() {
        let mut listener = SignalListener::install(&[Signal::SIGURG, Signal::SIGPROF]).unwrap();
        kill(nix::unistd::getpid(), Signal::SIGURG).unwrap();
        let received = tokio::time::timeout(std::time::Duration::from_secs(5), listener.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(Signal::SIGURG));
    }

    // ==================== Channel Tests ====================

    #[test]
    fn test_outbound_supports_only_routed_commands() {
        let channel = SignalChannel::outbound(Pid::from_raw(1));
        assert!(channel.supports(&Command::Close { graceful: true }));
        assert!(channel.supports(&Command::Close { graceful: false }));
        assert!(!channel.supports(&Command::Heartbeat));
    }

    #[test]
    fn test_close_variants_use_distinct_signals() {
        let channel = SignalChannel::outbound(Pid::from_raw(1));
        assert_eq!(
            channel.signal_for(&Command::Close { graceful: true }),
            Some(Signal::SIGTERM)
        );
        assert_eq!(
            channel.signal_for(&Command::Close { graceful: false }),
            Some(Signal::SIGINT)
        );
    }

    #[test]
    fn test_inbound_cannot_send() {
        let channel = SignalChannel::inbound();
        assert!(!channel.supports(&Command::Close { graceful: true }));
        assert!(matches!(
            channel.send(&Command::Close { graceful: true }),
            Err(ChannelError::NoRoute(_))
        ));
    }

    #[test]
    fn test_with_route_replaces_existing_mapping() {
        let channel = SignalChannel::outbound(Pid::from_raw(1))
            .with_route(Signal::SIGTERM, Command::Nop);
        assert!(channel.supports(&Command::Nop));
        assert!(!channel.supports(&Command::Close { graceful: true }));
    }

    #[tokio::test]
    async fn test_signal_to_self_arrives_as_command() {
        let receiver = SignalChannel::inbound().with_route(Signal::SIGUSR2, Command::Heartbeat);
        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.listen(tx.clone()).unwrap();
        assert!(matches!(receiver.listen(tx), Err(ChannelError::AlreadyListening)));

        let sender = SignalChannel::outbound(nix::unistd::getpid())
            .with_route(Signal::SIGUSR2, Command::Heartbeat);
        sender.send(&Command::Heartbeat).unwrap();

        let inbound = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("signal not delivered")
            .expect("sink closed");
        assert!(matches!(inbound, Inbound::Command(Command::Heartbeat)));
    }
}

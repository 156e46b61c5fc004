// ABOUTME: Transport abstraction carrying commands between primary and workers
//
// Key components:
// - stream: framed commands over any duplex byte stream (socketpair, stdio)
// - signal: commands mapped onto POSIX signals (fork backend only)
// - delegate: tries several channels in order, listens on all of them

pub mod delegate;
pub mod signal;
pub mod stream;

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::command::{Command, CommandError, CommandId};
use crate::protocol::ProtocolError;

pub use delegate::DelegatingChannel;
pub use signal::{SignalChannel, SignalListener};
pub use stream::StreamChannel;

/// Errors that can occur on a channel
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Byte stream is corrupt; the channel is unusable afterwards
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Command could not be mapped to or from a frame
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    /// No channel in a delegation chain accepts the command
    #[error("No route for command {0}")]
    NoRoute(CommandId),

    /// `listen` was already called on this channel
    #[error("Channel is already listening")]
    AlreadyListening,

    /// The transport has been closed
    #[error("Channel closed")]
    Closed,

    /// Signal could not be delivered to the peer
    #[error("Signal delivery failed: {0}")]
    Signal(String),

    /// I/O error on the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something received from a channel.
#[derive(Debug)]
pub enum Inbound {
    /// A decoded command.
    Command(Command),
    /// The peer sent an error frame.
    RemoteError(String),
    /// A frame that could not be mapped to a command; the channel stays usable.
    Unsupported(CommandError),
    /// Fatal transport or protocol failure; nothing follows.
    Failed(ChannelError),
    /// The peer closed the transport; nothing follows.
    Closed,
}

impl Inbound {
    /// True if no further messages will arrive from this source.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Closed)
    }
}

/// Where a listening channel delivers what it receives.
pub type InboundSender = mpsc::UnboundedSender<Inbound>;

/// Capability to exchange commands with a peer process.
pub trait Channel: Send + Sync + fmt::Debug {
    /// Whether this channel can carry `command`.
    fn supports(&self, command: &Command) -> bool;

    /// Queue `command` for delivery to the peer.
    fn send(&self, command: &Command) -> Result<(), ChannelError>;

    /// Start delivering received commands to `sink`.
    fn listen(&self, sink: InboundSender) -> Result<(), ChannelError>;

    /// Report an error to the peer, if the transport can carry one.
    fn send_error(&self, message: &str) -> Result<(), ChannelError> {
        let _ = message;
        Err(ChannelError::NoRoute(CommandId::Error))
    }
}

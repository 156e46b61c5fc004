// ABOUTME: Control commands exchanged between the primary and its workers
//
// Commands are plain values; `factory` maps each variant to a stable frame
// type id and payload shape.

pub mod factory;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worker::status::{ConnectionInfo, WorkerStatus};
use crate::worker::WorkerId;

pub use factory::CommandFactory;

/// Errors raised when mapping commands to frames and back
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The command variant is not in the factory table
    #[error("Unsupported command: {0}")]
    Unsupported(CommandId),

    /// The frame type id is not in the factory table
    #[error("Unsupported frame type: {0}")]
    UnknownFrameType(u8),

    /// The frame payload does not have the shape the variant expects
    #[error("Invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: CommandId, reason: String },
}

/// Generic control flags carried by [`Command::Control`].
///
/// Each control command carries the full flag set: pausing lasts until a
/// control command without [`ControlFlags::PAUSE_ACCEPT`] arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlFlags(u32);

impl ControlFlags {
    /// Wakes the worker main's reload hook.
    pub const RELOAD: Self = Self(0x01);
    /// Worker stops accepting new connections; open ones keep being served.
    pub const PAUSE_ACCEPT: Self = Self(0x02);

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ControlFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A typed control-plane message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Does nothing.
    Nop,
    /// Ask the peer to shut down.
    Close { graceful: bool },
    /// Primary asks a worker to prove it is alive.
    Heartbeat,
    /// Worker's answer to a heartbeat.
    Ping { worker_id: WorkerId },
    /// Answer to a ping.
    Pong,
    /// Generic control flags.
    Control { flags: ControlFlags },
    /// Application-defined text message.
    Message { text: String },
    /// Worker status snapshot, answering [`Command::Status`].
    WorkerStatus {
        worker_id: WorkerId,
        status: WorkerStatus,
    },
    /// Status query when `status` is `None`; otherwise an unsolicited snapshot.
    Status { status: Option<WorkerStatus> },
    /// Ask a worker for its open connections.
    ConnectionsQuery { worker_id: WorkerId },
    /// Connection list, answering [`Command::ConnectionsQuery`].
    Connections { connections: Vec<ConnectionInfo> },
}

impl Command {
    /// Data-less discriminator of this variant.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::Nop => CommandKind::Nop,
            Self::Close { .. } => CommandKind::Close,
            Self::Heartbeat => CommandKind::Heartbeat,
            Self::Ping { .. } => CommandKind::Ping,
            Self::Pong => CommandKind::Pong,
            Self::Control { .. } => CommandKind::Control,
            Self::Message { .. } => CommandKind::Message,
            Self::WorkerStatus { .. } => CommandKind::WorkerStatus,
            Self::Status { .. } => CommandKind::Status,
            Self::ConnectionsQuery { .. } => CommandKind::ConnectionsQuery,
            Self::Connections { .. } => CommandKind::Connections,
        }
    }

    /// String identifier used in logs and structured payload debugging.
    #[must_use]
    pub const fn id(&self) -> CommandId {
        match self {
            Self::Control { flags } if flags.contains(ControlFlags::RELOAD) => CommandId::Reload,
            _ => self.kind().id(),
        }
    }

    /// Stable key distinguishing variants that need separate transport routes.
    ///
    /// `Close { graceful: true }` and `Close { graceful: false }` map to
    /// different keys so each can be bound to its own signal.
    #[must_use]
    pub const fn key(&self) -> CommandKey {
        match self {
            Self::Close { graceful: true } => CommandKey::CLOSE_GRACEFUL,
            Self::Close { graceful: false } => CommandKey::CLOSE_FORCEFUL,
            _ => CommandKey(self.kind().id().as_str()),
        }
    }
}

/// Data-less command discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Nop,
    Close,
    Heartbeat,
    Ping,
    Pong,
    Control,
    Message,
    WorkerStatus,
    Status,
    ConnectionsQuery,
    Connections,
}

impl CommandKind {
    /// Every variant, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::Nop,
        Self::Close,
        Self::Heartbeat,
        Self::Ping,
        Self::Pong,
        Self::Control,
        Self::Message,
        Self::WorkerStatus,
        Self::Status,
        Self::ConnectionsQuery,
        Self::Connections,
    ];

    #[must_use]
    pub const fn id(self) -> CommandId {
        match self {
            Self::Nop => CommandId::Nop,
            Self::Close => CommandId::Close,
            Self::Heartbeat => CommandId::Heartbeat,
            Self::Ping => CommandId::Ping,
            Self::Pong => CommandId::Pong,
            Self::Control => CommandId::Control,
            Self::Message => CommandId::Message,
            Self::WorkerStatus => CommandId::WorkerStatus,
            Self::Status => CommandId::Status,
            Self::ConnectionsQuery => CommandId::Connections,
            Self::Connections => CommandId::WorkerConnections,
        }
    }
}

/// Human-readable command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    Nop,
    Close,
    Heartbeat,
    Ping,
    Pong,
    Control,
    Message,
    Status,
    Connections,
    WorkerStatus,
    WorkerConnections,
    WorkerClose,
    Reload,
    Error,
}

impl CommandId {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::Close => "CLOSE",
            Self::Heartbeat => "HEARTBEAT",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Control => "CONTROL",
            Self::Message => "MESSAGE",
            Self::Status => "STATUS",
            Self::Connections => "CONNECTIONS",
            Self::WorkerStatus => "WORKER_STATUS",
            Self::WorkerConnections => "WORKER_CONNECTIONS",
            Self::WorkerClose => "WORKER_CLOSE",
            Self::Reload => "RELOAD",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing key for a command, see [`Command::key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandKey(&'static str);

impl CommandKey {
    pub const CLOSE_GRACEFUL: Self = Self("CLOSE:graceful");
    pub const CLOSE_FORCEFUL: Self = Self("CLOSE:forceful");

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

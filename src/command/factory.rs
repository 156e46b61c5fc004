// ABOUTME: Explicit mapping between command variants and frame type ids
//
// The table is fixed and ordered; ids never depend on variant position so
// reordering the enum cannot silently change the wire format.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Command, CommandError, CommandKind, ControlFlags};
use crate::protocol::{Frame, Payload};
use crate::worker::status::{ConnectionInfo, WorkerStatus};
use crate::worker::WorkerId;

/// Frame type ids for every known command variant.
pub const STANDARD_TABLE: &[(CommandKind, u8)] = &[
    (CommandKind::Nop, 0),
    (CommandKind::Close, 1),
    (CommandKind::Heartbeat, 2),
    (CommandKind::Ping, 3),
    (CommandKind::Pong, 4),
    (CommandKind::Control, 5),
    (CommandKind::Message, 6),
    (CommandKind::WorkerStatus, 7),
    (CommandKind::Status, 8),
    (CommandKind::ConnectionsQuery, 9),
    (CommandKind::Connections, 10),
];

#[derive(Serialize, Deserialize)]
struct ClosePayload {
    graceful: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerRefPayload {
    worker_id: WorkerId,
}

#[derive(Serialize, Deserialize)]
struct ControlPayload {
    flags: ControlFlags,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerStatusPayload {
    worker_id: WorkerId,
    status: WorkerStatus,
}

#[derive(Serialize, Deserialize)]
struct StatusPayload {
    status: Option<WorkerStatus>,
}

#[derive(Serialize, Deserialize)]
struct ConnectionsPayload {
    connections: Vec<ConnectionInfo>,
}

/// Translates commands to frames and back.
#[derive(Debug, Clone)]
pub struct CommandFactory {
    table: Vec<(CommandKind, u8)>,
}

impl CommandFactory {
    /// Factory knowing every command variant.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            table: STANDARD_TABLE.to_vec(),
        }
    }

    /// Factory restricted to a subset of the standard table.
    ///
    /// Useful for peers speaking an older command set.
    #[must_use]
    pub fn with_kinds(kinds: &[CommandKind]) -> Self {
        Self {
            table: STANDARD_TABLE
                .iter()
                .copied()
                .filter(|(kind, _)| kinds.contains(kind))
                .collect(),
        }
    }

    /// Frame type id for a variant, if known.
    #[must_use]
    pub fn type_id(&self, kind: CommandKind) -> Option<u8> {
        self.table
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, id)| *id)
    }

    /// Variant for a frame type id, if known.
    #[must_use]
    pub fn kind_of(&self, type_id: u8) -> Option<CommandKind> {
        self.table
            .iter()
            .find(|(_, id)| *id == type_id)
            .map(|(kind, _)| *kind)
    }

    #[must_use]
    pub fn supports(&self, command: &Command) -> bool {
        self.type_id(command.kind()).is_some()
    }

    /// Encode a command as a frame.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Unsupported`] if the variant is not in the table.
    pub fn create_frame(&self, command: &Command) -> Result<Frame, CommandError> {
        let kind = command.kind();
        let type_id = self
            .type_id(kind)
            .ok_or(CommandError::Unsupported(command.id()))?;

        let payload = match command {
            Command::Nop | Command::Heartbeat | Command::Pong => Payload::None,
            Command::Close { graceful } => json_payload(kind, &ClosePayload { graceful: *graceful })?,
            Command::Ping { worker_id } | Command::ConnectionsQuery { worker_id } => {
                json_payload(kind, &WorkerRefPayload { worker_id: *worker_id })?
            }
            Command::Control { flags } => json_payload(kind, &ControlPayload { flags: *flags })?,
            Command::Message { text } => Payload::Raw(text.as_bytes().to_vec()),
            Command::WorkerStatus { worker_id, status } => json_payload(
                kind,
                &WorkerStatusPayload {
                    worker_id: *worker_id,
                    status: status.clone(),
                },
            )?,
            Command::Status { status } => json_payload(
                kind,
                &StatusPayload {
                    status: status.clone(),
                },
            )?,
            Command::Connections { connections } => json_payload(
                kind,
                &ConnectionsPayload {
                    connections: connections.clone(),
                },
            )?,
        };

        Ok(Frame::new(type_id, payload))
    }

    /// Decode a frame into a command.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::UnknownFrameType`] for ids missing from the table
    /// and [`CommandError::InvalidPayload`] when the payload has the wrong shape.
    pub fn create_command(&self, frame: &Frame) -> Result<Command, CommandError> {
        let kind = self
            .kind_of(frame.frame_type())
            .ok_or(CommandError::UnknownFrameType(frame.frame_type()))?;
        let payload = frame.payload();

        let command = match kind {
            CommandKind::Nop => expect_empty(kind, payload).map(|()| Command::Nop)?,
            CommandKind::Heartbeat => expect_empty(kind, payload).map(|()| Command::Heartbeat)?,
            CommandKind::Pong => expect_empty(kind, payload).map(|()| Command::Pong)?,
            CommandKind::Close => {
                let ClosePayload { graceful } = from_json(kind, payload)?;
                Command::Close { graceful }
            }
            CommandKind::Ping => {
                let WorkerRefPayload { worker_id } = from_json(kind, payload)?;
                Command::Ping { worker_id }
            }
            CommandKind::ConnectionsQuery => {
                let WorkerRefPayload { worker_id } = from_json(kind, payload)?;
                Command::ConnectionsQuery { worker_id }
            }
            CommandKind::Control => {
                let ControlPayload { flags } = from_json(kind, payload)?;
                Command::Control { flags }
            }
            CommandKind::Message => match payload {
                Payload::Raw(bytes) => Command::Message {
                    text: String::from_utf8(bytes.clone()).map_err(|e| {
                        CommandError::InvalidPayload {
                            kind: kind.id(),
                            reason: e.to_string(),
                        }
                    })?,
                },
                _ => return Err(wrong_shape(kind, "expected raw payload")),
            },
            CommandKind::WorkerStatus => {
                let WorkerStatusPayload { worker_id, status } = from_json(kind, payload)?;
                Command::WorkerStatus { worker_id, status }
            }
            CommandKind::Status => {
                let StatusPayload { status } = from_json(kind, payload)?;
                Command::Status { status }
            }
            CommandKind::Connections => {
                let ConnectionsPayload { connections } = from_json(kind, payload)?;
                Command::Connections { connections }
            }
        };

        Ok(command)
    }
}

impl Default for CommandFactory {
    fn default() -> Self {
        Self::standard()
    }
}

fn wrong_shape(kind: CommandKind, reason: &str) -> CommandError {
    CommandError::InvalidPayload {
        kind: kind.id(),
        reason: reason.to_string(),
    }
}

fn json_payload<T: Serialize>(kind: CommandKind, value: &T) -> Result<Payload, CommandError> {
    serde_json::to_value(value)
        .map(Payload::Json)
        .map_err(|e| wrong_shape(kind, &e.to_string()))
}

fn from_json<T: DeserializeOwned>(kind: CommandKind, payload: &Payload) -> Result<T, CommandError> {
    match payload {
        Payload::Json(value) => {
            T::deserialize(value).map_err(|e| wrong_shape(kind, &e.to_string()))
        }
        _ => Err(wrong_shape(kind, "expected JSON payload")),
    }
}

fn expect_empty(kind: CommandKind, payload: &Payload) -> Result<(), CommandError> {
    match payload {
        Payload::None => Ok(()),
        _ => Err(wrong_shape(kind, "expected no payload")),
    }
}

/// Borrowing helper so tests and callers can peek at JSON payload fields.
#[must_use]
pub fn json_field<'a>(frame: &'a Frame, field: &str) -> Option<&'a Value> {
    match frame.payload() {
        Payload::Json(value) => value.get(field),
        _ => None,
    }
}

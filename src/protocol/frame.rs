// ABOUTME: Binary frame codec for control messages between primary and workers
//
// Header layout (10 bytes, little-endian):
//
// ```text
// [u8 type] [u8 version:2 | flags:6] [u64 payload size] [payload]
// ```
//
// The flags pick exactly one payload encoding; the top two bits of the flags
// byte carry the protocol version.

use serde_json::Value;
use thiserror::Error;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 10;

/// Protocol version stored in the top two bits of the flags byte.
pub const PROTOCOL_VERSION: u8 = 1;

/// Hard upper bound for a single payload, independent of configuration.
pub const MAX_PAYLOAD_SIZE: u64 = 64 * 1024 * 1024;

/// Frame type reserved for error frames.
pub const ERROR_FRAME_TYPE: u8 = 0xFF;

const VERSION_SHIFT: u8 = 6;
const FLAGS_MASK: u8 = 0x3F;

/// Errors raised while packing or parsing frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not enough bytes to hold a header
    #[error("Truncated header: need {needed} bytes, got {got}")]
    TruncatedHeader { needed: usize, got: usize },

    /// Version bits do not match this implementation
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Flags byte does not name exactly one known payload encoding
    #[error("Invalid frame flags: 0x{0:02x}")]
    InvalidFlags(u8),

    /// Declared payload size disagrees with the bytes available or the flags
    #[error("Payload size mismatch: declared {declared}, actual {actual}")]
    PayloadSizeMismatch { declared: u64, actual: u64 },

    /// Declared payload size exceeds the allowed maximum
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    /// Structured payload could not be encoded or decoded
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

/// Payload encoding selector carried in the header.
///
/// Exactly one bit is set on a well-formed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No payload follows the header.
    pub const NONE: Self = Self(0x02);
    /// Payload is written verbatim.
    pub const RAW: Self = Self(0x04);
    /// Payload is a JSON object `{ "message": .. }` describing a remote error.
    pub const ERROR: Self = Self(0x08);
    /// Payload is a JSON document.
    pub const JSON: Self = Self(0x10);

    /// Raw flag bits without the version.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Validate raw flag bits (version already stripped).
    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        match bits {
            0x02 => Ok(Self::NONE),
            0x04 => Ok(Self::RAW),
            0x08 => Ok(Self::ERROR),
            0x10 => Ok(Self::JSON),
            other => Err(ProtocolError::InvalidFlags(other)),
        }
    }

    /// Flags byte as written on the wire, version bits included.
    #[must_use]
    pub const fn wire_byte(self) -> u8 {
        (PROTOCOL_VERSION << VERSION_SHIFT) | self.0
    }
}

/// Decoded frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Empty payload.
    None,
    /// Opaque bytes.
    Raw(Vec<u8>),
    /// Structured JSON document.
    Json(Value),
    /// Error reported by the peer.
    Error { message: String },
}

impl Payload {
    /// Flags that describe how this payload is encoded.
    #[must_use]
    pub const fn flags(&self) -> FrameFlags {
        match self {
            Self::None => FrameFlags::NONE,
            Self::Raw(_) => FrameFlags::RAW,
            Self::Json(_) => FrameFlags::JSON,
            Self::Error { .. } => FrameFlags::ERROR,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::None => Ok(Vec::new()),
            Self::Raw(bytes) => Ok(bytes.clone()),
            Self::Json(value) => serde_json::to_vec(value)
                .map_err(|e| ProtocolError::MalformedPayload(e.to_string())),
            Self::Error { message } => serde_json::to_vec(&serde_json::json!({ "message": message }))
                .map_err(|e| ProtocolError::MalformedPayload(e.to_string())),
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Stable discriminator of the command variant.
    pub frame_type: u8,
    /// Payload encoding.
    pub flags: FrameFlags,
    /// Payload length in bytes.
    pub size: u64,
}

/// One control message on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    frame_type: u8,
    payload: Payload,
}

impl Frame {
    /// Create a frame; the flags are derived from the payload.
    #[must_use]
    pub const fn new(frame_type: u8, payload: Payload) -> Self {
        Self { frame_type, payload }
    }

    /// Frame without payload.
    #[must_use]
    pub const fn empty(frame_type: u8) -> Self {
        Self::new(frame_type, Payload::None)
    }

    /// Frame with a JSON payload.
    #[must_use]
    pub const fn json(frame_type: u8, value: Value) -> Self {
        Self::new(frame_type, Payload::Json(value))
    }

    /// Frame with a raw byte payload.
    #[must_use]
    pub const fn raw(frame_type: u8, bytes: Vec<u8>) -> Self {
        Self::new(frame_type, Payload::Raw(bytes))
    }

    /// Error frame carrying a message for the peer.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            ERROR_FRAME_TYPE,
            Payload::Error {
                message: message.into(),
            },
        )
    }

    #[must_use]
    pub const fn frame_type(&self) -> u8 {
        self.frame_type
    }

    #[must_use]
    pub const fn flags(&self) -> FrameFlags {
        self.payload.flags()
    }

    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Consume the frame, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Encode header and payload into wire bytes.
    ///
    /// # Errors
    ///
    /// Fails if the payload cannot be serialized or exceeds [`MAX_PAYLOAD_SIZE`].
    pub fn pack(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = self.payload.encode()?;
        let size = body.len() as u64;
        if size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
        buf.push(self.frame_type);
        buf.push(self.flags().wire_byte());
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode one complete frame from exactly `HEADER_SIZE + size` bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let header = parse_header(bytes)?;
        let body = &bytes[HEADER_SIZE..];
        if body.len() as u64 != header.size {
            return Err(ProtocolError::PayloadSizeMismatch {
                declared: header.size,
                actual: body.len() as u64,
            });
        }
        let payload = parse_payload(header.flags, body)?;
        Ok(Self::new(header.frame_type, payload))
    }
}

/// Parse the fixed-size header at the start of `bytes`.
///
/// Only the first [`HEADER_SIZE`] bytes are inspected.
pub fn parse_header(bytes: &[u8]) -> Result<FrameHeader, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::TruncatedHeader {
            needed: HEADER_SIZE,
            got: bytes.len(),
        });
    }

    let frame_type = bytes[0];
    let version = bytes[1] >> VERSION_SHIFT;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let flags = FrameFlags::from_bits(bytes[1] & FLAGS_MASK)?;

    let mut size_bytes = [0u8; 8];
    size_bytes.copy_from_slice(&bytes[2..HEADER_SIZE]);
    let size = u64::from_le_bytes(size_bytes);

    if size > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    if flags == FrameFlags::NONE && size != 0 {
        return Err(ProtocolError::PayloadSizeMismatch {
            declared: size,
            actual: 0,
        });
    }

    Ok(FrameHeader {
        frame_type,
        flags,
        size,
    })
}

/// Decode a payload according to its flags.
pub fn parse_payload(flags: FrameFlags, bytes: &[u8]) -> Result<Payload, ProtocolError> {
    match flags {
        FrameFlags::NONE => {
            if bytes.is_empty() {
                Ok(Payload::None)
            } else {
                Err(ProtocolError::PayloadSizeMismatch {
                    declared: 0,
                    actual: bytes.len() as u64,
                })
            }
        }
        FrameFlags::RAW => Ok(Payload::Raw(bytes.to_vec())),
        FrameFlags::JSON => serde_json::from_slice(bytes)
            .map(Payload::Json)
            .map_err(|e| ProtocolError::MalformedPayload(e.to_string())),
        FrameFlags::ERROR => {
            let value: Value = serde_json::from_slice(bytes)
                .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ProtocolError::MalformedPayload("error frame without message".to_string())
                })?
                .to_string();
            Ok(Payload::Error { message })
        }
        other => Err(ProtocolError::InvalidFlags(other.bits())),
    }
}

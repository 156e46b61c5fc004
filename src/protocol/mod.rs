// ABOUTME: Wire protocol for the primary <-> worker control channel
//
// Key components:
// - frame: fixed 10-byte header plus typed payload (pack / parse)
// - reassembler: incremental byte-stream to frame parser

pub mod frame;
pub mod reassembler;

pub use frame::{
    Frame, FrameFlags, FrameHeader, Payload, ProtocolError, ERROR_FRAME_TYPE, HEADER_SIZE,
    MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};
pub use reassembler::FrameReassembler;

// ABOUTME: Incremental frame parser for byte streams (pipes, sockets, stdio)
//
// Bytes are appended with `push`; `drain` extracts every complete frame and
// keeps any partial header or payload buffered for the next push.

use super::frame::{
    parse_header, parse_payload, Frame, FrameHeader, ProtocolError, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};

/// Reassembles frames from an arbitrarily chunked byte stream.
#[derive(Debug)]
pub struct FrameReassembler {
    buf: Vec<u8>,
    pending: Option<FrameHeader>,
    max_payload: u64,
}

impl FrameReassembler {
    /// Create a reassembler accepting payloads up to the protocol maximum.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(MAX_PAYLOAD_SIZE)
    }

    /// Create a reassembler with a lower payload size limit.
    #[must_use]
    pub fn with_limit(max_payload: u64) -> Self {
        Self {
            buf: Vec::new(),
            pending: None,
            max_payload: max_payload.min(MAX_PAYLOAD_SIZE),
        }
    }

    /// Append bytes read from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Extract all complete frames in arrival order.
    ///
    /// # Errors
    ///
    /// Returns the first protocol error encountered. The stream is corrupt at
    /// that point and the reassembler should be discarded.
    pub fn drain(&mut self) -> Result<Vec<Frame>, ProtocolError> {
        let mut frames = Vec::new();

        loop {
            let header = match self.pending {
                Some(header) => header,
                None => {
                    if self.buf.len() < HEADER_SIZE {
                        break;
                    }
                    let header = parse_header(&self.buf[..HEADER_SIZE])?;
                    if header.size > self.max_payload {
                        return Err(ProtocolError::FrameTooLarge {
                            size: header.size,
                            max: self.max_payload,
                        });
                    }
                    self.buf.drain(..HEADER_SIZE);
                    self.pending = Some(header);
                    header
                }
            };

            // Bounded by max_payload, which fits in usize on supported targets
            #[allow(clippy::cast_possible_truncation)]
            let size = header.size as usize;
            if self.buf.len() < size {
                break;
            }

            let payload = parse_payload(header.flags, &self.buf[..size])?;
            self.buf.drain(..size);
            self.pending = None;
            frames.push(Frame::new(header.frame_type, payload));
        }

        Ok(frames)
    }

    /// Convenience wrapper: push then drain.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        self.push(chunk);
        self.drain()
    }

    /// Returns true if a partial frame is buffered.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        self.pending.is_some() || !self.buf.is_empty()
    }

    /// Number of buffered bytes not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::FrameFlags;
    use serde_json::json;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::json(1, json!({"graceful": true})),
            Frame::empty(2),
            Frame::raw(6, b"hello worker".to_vec()),
            Frame::json(7, json!({"workerId": 3, "status": {"pid": 4242}})),
            Frame::error("boom"),
        ]
    }

    #[test]
    fn test_single_frame() {
        let frame = Frame::json(3, json!({"id": "hello"}));
        let mut reassembler = FrameReassembler::new();
        let frames = reassembler.feed(&frame.pack().unwrap()).unwrap();
        assert_eq!(frames, vec![frame]);
        assert!(!reassembler.has_partial());
    }

    #[test]
    fn test_split_at_every_boundary() {
        let frame = Frame::json(7, json!({"workerId": 12, "status": {"pid": 77}}));
        let bytes = frame.pack().unwrap();

        for split in 0..=bytes.len() {
            let mut reassembler = FrameReassembler::new();
            let mut frames = reassembler.feed(&bytes[..split]).unwrap();
            frames.extend(reassembler.feed(&bytes[split..]).unwrap());
            assert_eq!(frames, vec![frame.clone()], "split at {split}");
            assert!(!reassembler.has_partial());
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let frame = Frame::raw(6, b"x".to_vec());
        let bytes = frame.pack().unwrap();

        let mut reassembler = FrameReassembler::new();
        let mut decoded = Vec::new();
        for (i, byte) in bytes.iter().enumerate() {
            let frames = reassembler.feed(&[*byte]).unwrap();
            if i < bytes.len() - 1 {
                assert!(frames.is_empty());
            }
            decoded.extend(frames);
        }
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn test_batched_frames_keep_order() {
        let frames = sample_frames();
        let mut batch = Vec::new();
        for frame in &frames {
            batch.extend_from_slice(&frame.pack().unwrap());
        }

        let mut reassembler = FrameReassembler::new();
        reassembler.push(&batch);
        assert_eq!(reassembler.drain().unwrap(), frames);
    }

    #[test]
    fn test_drain_is_idempotent_with_partial_data() {
        let first = Frame::empty(2);
        let second = Frame::raw(6, b"partial".to_vec());
        let mut bytes = first.pack().unwrap();
        let second_bytes = second.pack().unwrap();
        bytes.extend_from_slice(&second_bytes[..HEADER_SIZE + 3]);

        let mut reassembler = FrameReassembler::new();
        reassembler.push(&bytes);
        assert_eq!(reassembler.drain().unwrap(), vec![first]);
        assert!(reassembler.drain().unwrap().is_empty());
        assert!(reassembler.drain().unwrap().is_empty());
        assert!(reassembler.has_partial());

        reassembler.push(&second_bytes[HEADER_SIZE + 3..]);
        assert_eq!(reassembler.drain().unwrap(), vec![second]);
    }

    #[test]
    fn test_many_pipelined_frames() {
        let frame = Frame::empty(2);
        let one = frame.pack().unwrap();
        let batch: Vec<u8> = one.iter().copied().cycle().take(one.len() * 50_000).collect();

        let mut reassembler = FrameReassembler::new();
        let frames = reassembler.feed(&batch).unwrap();
        assert_eq!(frames.len(), 50_000);
    }

    #[test]
    fn test_limit_rejects_large_frame() {
        let frame = Frame::raw(6, vec![0u8; 64]);
        let mut reassembler = FrameReassembler::with_limit(32);
        assert!(matches!(
            reassembler.feed(&frame.pack().unwrap()),
            Err(ProtocolError::FrameTooLarge { size: 64, max: 32 })
        ));
    }

    #[test]
    fn test_corrupt_header_is_an_error() {
        let mut bytes = Frame::empty(1).pack().unwrap();
        bytes[1] = (crate::protocol::PROTOCOL_VERSION << 6) | 0x3F;
        let mut reassembler = FrameReassembler::new();
        assert!(reassembler.feed(&bytes).is_err());
    }

    #[test]
    fn test_flags_survive_reassembly() {
        let mut reassembler = FrameReassembler::new();
        let frames = reassembler
            .feed(&Frame::error("bad").pack().unwrap())
            .unwrap();
        assert_eq!(frames[0].flags(), FrameFlags::ERROR);
    }
}

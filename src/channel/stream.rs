// ABOUTME: Stream channel sending framed commands over a duplex byte transport
//
// Writes go through an unbounded queue drained by a writer task so `send`
// never blocks the reactor. `listen` hands the read half to a reader task that
// feeds a FrameReassembler and forwards decoded commands in arrival order.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Channel, ChannelError, Inbound, InboundSender};
use crate::command::{Command, CommandFactory};
use crate::protocol::{Frame, FrameReassembler, Payload, MAX_PAYLOAD_SIZE};

const READ_BUFFER_SIZE: usize = 8 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Channel over a byte stream such as a socketpair end or child stdio.
pub struct StreamChannel {
    label: String,
    factory: Arc<CommandFactory>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: Mutex<Option<BoxedReader>>,
    max_payload: u64,
}

impl std::fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel")
            .field("label", &self.label)
            .field("max_payload", &self.max_payload)
            .field("closed", &self.outbound.is_closed())
            .finish()
    }
}

impl StreamChannel {
    /// Wrap a read half and a write half.
    ///
    /// Must be called inside a tokio runtime; the writer task is spawned here.
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W, factory: Arc<CommandFactory>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let label = label.into();
        let (outbound, queue) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(label.clone(), writer, queue));

        Self {
            label,
            factory,
            outbound,
            reader: Mutex::new(Some(Box::new(reader))),
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    /// Reject inbound frames larger than `limit` bytes.
    #[must_use]
    pub fn with_max_payload(mut self, limit: u64) -> Self {
        self.max_payload = limit;
        self
    }

    fn write_frame(&self, frame: &Frame) -> Result<(), ChannelError> {
        let bytes = frame.pack()?;
        self.outbound.send(bytes).map_err(|_| ChannelError::Closed)
    }
}

impl Channel for StreamChannel {
    fn supports(&self, command: &Command) -> bool {
        self.factory.supports(command)
    }

    fn send(&self, command: &Command) -> Result<(), ChannelError> {
        let frame = self.factory.create_frame(command)?;
        self.write_frame(&frame)
    }

    fn listen(&self, sink: InboundSender) -> Result<(), ChannelError> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ChannelError::AlreadyListening)?;

        tokio::spawn(read_loop(
            self.label.clone(),
            reader,
            Arc::clone(&self.factory),
            sink,
            self.max_payload,
        ));
        Ok(())
    }

    fn send_error(&self, message: &str) -> Result<(), ChannelError> {
        self.write_frame(&Frame::error(message))
    }
}

async fn write_loop<W>(label: String, mut writer: W, mut queue: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(bytes) = queue.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            warn!(channel = %label, error = %e, "Channel write failed");
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!(channel = %label, error = %e, "Channel flush failed");
            return;
        }
    }

    // All senders dropped: let the peer observe EOF
    let _ = writer.shutdown().await;
    debug!(channel = %label, "Channel writer finished");
}

async fn read_loop(
    label: String,
    mut reader: BoxedReader,
    factory: Arc<CommandFactory>,
    sink: InboundSender,
    max_payload: u64,
) {
    let mut reassembler = FrameReassembler::with_limit(max_payload);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(channel = %label, "Channel reached EOF");
                let _ = sink.send(Inbound::Closed);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                let _ = sink.send(Inbound::Failed(ChannelError::Io(e)));
                return;
            }
        };

        reassembler.push(&buf[..n]);
        let frames = match reassembler.drain() {
            Ok(frames) => frames,
            Err(e) => {
                warn!(channel = %label, error = %e, "Closing channel after protocol error");
                let _ = sink.send(Inbound::Failed(ChannelError::Protocol(e)));
                return;
            }
        };

        for frame in frames {
            let message = match frame.payload() {
                Payload::Error { message } => Inbound::RemoteError(message.clone()),
                _ => match factory.create_command(&frame) {
                    Ok(command) => Inbound::Command(command),
                    Err(e) => {
                        debug!(channel = %label, error = %e, "Unsupported frame");
                        Inbound::Unsupported(e)
                    }
                },
            };

            if sink.send(message).is_err() {
                // Nobody is listening anymore
                return;
            }
        }
    }
}

// ABOUTME: Composite channel that routes each command to the first capable child

use super::{Channel, ChannelError, InboundSender};
use crate::command::{Command, CommandId};

/// Ordered list of channels acting as one.
///
/// `send` picks the first child whose `supports` accepts the command.
/// `listen` registers the sink with every child.
#[derive(Debug, Default)]
pub struct DelegatingChannel {
    channels: Vec<Box<dyn Channel>>,
}

impl DelegatingChannel {
    #[must_use]
    pub fn new(channels: Vec<Box<dyn Channel>>) -> Self {
        Self { channels }
    }

    /// Append a lower-priority child.
    #[must_use]
    pub fn with(mut self, channel: impl Channel + 'static) -> Self {
        self.channels.push(Box::new(channel));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Channel for DelegatingChannel {
    fn supports(&self, command: &Command) -> bool {
        self.channels.iter().any(|c| c.supports(command))
    }

    fn send(&self, command: &Command) -> Result<(), ChannelError> {
        self.channels
            .iter()
            .find(|c| c.supports(command))
            .ok_or(ChannelError::NoRoute(command.id()))?
            .send(command)
    }

    fn listen(&self, sink: InboundSender) -> Result<(), ChannelError> {
        for channel in &self.channels {
            channel.listen(sink.clone())?;
        }
        Ok(())
    }

    fn send_error(&self, message: &str) -> Result<(), ChannelError> {
        for channel in &self.channels {
            if channel.send_error(message).is_ok() {
                return Ok(());
            }
        }
        Err(ChannelError::NoRoute(CommandId::Error))
    }
}

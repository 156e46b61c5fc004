// ABOUTME: Typed lifecycle events published by workers, the pool and the cluster
//
// Collaborators subscribe to an EventBus and match on ClusterEvent; there is
// no string-keyed emitter. Slow subscribers lag and lose old events rather
// than blocking the reactor.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

use crate::command::{Command, ControlFlags};
use crate::worker::status::{ConnectionInfo, WorkerStatus};
use crate::worker::WorkerId;

const DEFAULT_CAPACITY: usize = 256;

/// Something that happened in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A process finished booting its reactor.
    Start { pid: u32 },
    /// A process is shutting down. Emitted exactly once per process.
    Close { graceful: bool },
    /// A non-fatal error worth surfacing.
    Error {
        worker_id: Option<WorkerId>,
        message: String,
    },
    /// Any command received over a channel.
    Command {
        worker_id: Option<WorkerId>,
        command: Command,
    },
    /// A worker accepted a connection.
    Connection {
        worker_id: WorkerId,
        peer_address: String,
    },
    /// The primary started a worker process.
    WorkerStart { worker_id: WorkerId, pid: u32 },
    /// The primary observed a worker process exit.
    WorkerClose {
        worker_id: WorkerId,
        pid: u32,
        graceful: bool,
    },
    /// A worker answered a heartbeat.
    Ping {
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },
    Pong { worker_id: WorkerId },
    Message { worker_id: WorkerId, text: String },
    Status {
        worker_id: WorkerId,
        status: WorkerStatus,
    },
    Connections {
        worker_id: WorkerId,
        connections: Vec<ConnectionInfo>,
    },
    Control {
        worker_id: WorkerId,
        flags: ControlFlags,
    },
}

impl ClusterEvent {
    /// Stable event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Close { .. } => "close",
            Self::Error { .. } => "error",
            Self::Command { .. } => "command",
            Self::Connection { .. } => "connection",
            Self::WorkerStart { .. } => "worker.start",
            Self::WorkerClose { .. } => "worker.close",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Message { .. } => "message",
            Self::Status { .. } => "status",
            Self::Connections { .. } => "connections",
            Self::Control { .. } => "control",
        }
    }
}

/// Broadcast bus for [`ClusterEvent`]s. Cloning shares the bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClusterEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; dropped silently when nobody subscribes.
    pub fn emit(&self, event: ClusterEvent) {
        trace!(event = event.name(), "Emitting event");
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(ClusterEvent::Start { pid: 1 }.name(), "start");
        assert_eq!(
            ClusterEvent::WorkerStart {
                worker_id: WorkerId(1),
                pid: 2
            }
            .name(),
            "worker.start"
        );
        assert_eq!(
            ClusterEvent::WorkerClose {
                worker_id: WorkerId(1),
                pid: 2,
                graceful: true
            }
            .name(),
            "worker.close"
        );
        assert_eq!(ClusterEvent::Pong { worker_id: WorkerId(4) }.name(), "pong");
    }

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(ClusterEvent::Start { pid: 10 });
        bus.emit(ClusterEvent::Close { graceful: true });

        assert_eq!(rx.recv().await.unwrap(), ClusterEvent::Start { pid: 10 });
        assert_eq!(rx.recv().await.unwrap(), ClusterEvent::Close { graceful: true });
    }

    #[test]
    fn test_emit_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(ClusterEvent::Start { pid: 1 });
    }
}

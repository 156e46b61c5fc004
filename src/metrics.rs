// ABOUTME: Counters for cluster supervision activity
//
// Tracks:
// - Workers: started, exited, restarted, force-killed
// - Control plane: commands sent and received, protocol errors

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cluster-level counters, shared between the pool and the supervise loop
#[derive(Debug, Default)]
pub struct ClusterMetrics {
    pub workers_started: AtomicU64,
    pub workers_exited: AtomicU64,
    pub restarts: AtomicU64,
    pub forced_kills: AtomicU64,
    pub commands_sent: AtomicU64,
    pub commands_received: AtomicU64,
    pub protocol_errors: AtomicU64,
}

/// Plain-value copy of [`ClusterMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub workers_started: u64,
    pub workers_exited: u64,
    pub restarts: u64,
    pub forced_kills: u64,
    pub commands_sent: u64,
    pub commands_received: u64,
    pub protocol_errors: u64,
}

impl ClusterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker_started(&self) {
        self.workers_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_exited(&self) {
        self.workers_exited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_restarted(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_killed(&self) {
        self.forced_kills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            workers_started: self.workers_started.load(Ordering::Relaxed),
            workers_exited: self.workers_exited.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            forced_kills: self.forced_kills.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = ClusterMetrics::new();
        metrics.worker_started();
        metrics.worker_started();
        metrics.worker_exited();
        metrics.worker_restarted();
        metrics.command_sent();
        metrics.protocol_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.workers_started, 2);
        assert_eq!(snapshot.workers_exited, 1);
        assert_eq!(snapshot.restarts, 1);
        assert_eq!(snapshot.forced_kills, 0);
        assert_eq!(snapshot.commands_sent, 1);
        assert_eq!(snapshot.commands_received, 0);
        assert_eq!(snapshot.protocol_errors, 1);
    }
}

// ABOUTME: Worker status snapshots and connection metadata tracking
//
// A worker keeps a ConnectionTracker for the sockets it has accepted; the
// tracker feeds WorkerStatus.activeConnections and the Connections reply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Point-in-time view of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub pid: u32,
    pub listening_address: Option<String>,
    pub memory_usage_bytes: u64,
    pub active_connections: usize,
}

/// Metadata for one accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub peer_address: String,
    pub local_address: String,
    pub accepted_at: DateTime<Utc>,
}

/// Shared registry of open connections inside a worker.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<Mutex<HashMap<Uuid, ConnectionInfo>>>,
}

impl ConnectionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; it stays listed until the guard is dropped.
    pub fn track(&self, peer_address: String, local_address: String) -> ConnectionGuard {
        let info = ConnectionInfo {
            id: Uuid::new_v4(),
            peer_address,
            local_address,
            accepted_at: Utc::now(),
        };
        let id = info.id;
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, info);

        ConnectionGuard {
            id,
            tracker: self.clone(),
        }
    }

    /// Number of open connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open connections ordered by accept time.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        list.sort_by_key(|c| c.accepted_at);
        list
    }

    fn remove(&self, id: Uuid) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Deregisters its connection when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    id: Uuid,
    tracker: ConnectionTracker,
}

impl ConnectionGuard {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Metadata recorded for this connection.
    #[must_use]
    pub fn info(&self) -> Option<ConnectionInfo> {
        self.tracker
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.id)
            .cloned()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.remove(self.id);
    }
}

/// Resident set size of the current process in bytes.
///
/// Reads `VmRSS` from `/proc/self/status`; returns 0 where procfs is absent.
#[must_use]
pub fn memory_usage_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_vm_rss(&status))
        .unwrap_or(0)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_guard_lifecycle() {
        let tracker = ConnectionTracker::new();
        assert!(tracker.is_empty());

        let first = tracker.track("10.0.0.2:5000".into(), "10.0.0.1:80".into());
        let second = tracker.track("10.0.0.3:5001".into(), "10.0.0.1:80".into());
        assert_eq!(tracker.len(), 2);
        assert_eq!(first.info().unwrap().peer_address, "10.0.0.2:5000");

        drop(first);
        let remaining = tracker.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, second.id());

        drop(second);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tprefork\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memory_usage_is_reported_on_linux() {
        assert!(memory_usage_bytes() > 0);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = WorkerStatus {
            pid: 1,
            listening_address: None,
            memory_usage_bytes: 3,
            active_connections: 0,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert!(value.get("memoryUsageBytes").is_some());
        assert!(value.get("listeningAddress").is_some());
    }
}

// ABOUTME: Integration tests driving a real fork-backed cluster: self-healing, heartbeats, closes

use std::net::SocketAddr;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use pretty_assertions::assert_eq;
use serial_test::serial;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use prefork::cli::serve::echo_main;
use prefork::cluster::LISTEN_ENV;
use prefork::worker::runtime::idle_main;
use prefork::worker::ExitStatus;
use prefork::{BackendKind, Cluster, ClusterConfig, ClusterContext, ClusterEvent, WorkerId, WorkerMain, WorkerState};

const DEADLINE: Duration = Duration::from_secs(10);

fn cluster(workers: usize) -> Cluster {
    cluster_with(workers, idle_main())
}

fn cluster_with(workers: usize, main: WorkerMain) -> Cluster {
    let config = ClusterConfig {
        workers,
        backend: BackendKind::Fork,
        poll_interval: Duration::from_millis(20),
        restart_backoff_base: Duration::from_millis(20),
        graceful_timeout: Duration::from_secs(5),
        ..ClusterConfig::default()
    };
    Cluster::new(ClusterContext::primary(), config, main).unwrap()
}

fn pid_of(pid: u32) -> Pid {
    Pid::from_raw(i32::try_from(pid).unwrap())
}

/// Run supervision passes and dispatch worker messages until `done` holds.
async fn supervise_until(cluster: &mut Cluster, mut done: impl FnMut(&Cluster) -> bool) {
    let result = tokio::time::timeout(DEADLINE, async {
        while !done(cluster) {
            cluster.tick().unwrap();
            if let Ok(Some((id, inbound))) =
                tokio::time::timeout(Duration::from_millis(20), cluster.pool_mut().recv_inbound()).await
            {
                cluster.pool_mut().dispatch(id, inbound);
            }
        }
    })
    .await;
    assert!(result.is_ok(), "condition not reached within {DEADLINE:?}");
}

fn drain_events(events: &mut broadcast::Receiver<ClusterEvent>) -> Vec<ClusterEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

// ==================== Self-healing Tests ====================

#[tokio::test]
#[serial]
async fn test_pool_restores_capacity_after_worker_is_killed() {
    let mut cluster = cluster(3);
    assert_eq!(cluster.start().unwrap(), 3);
    assert_eq!(cluster.pool().started_count(), 3);

    let victim = &cluster.pool().workers()[1];
    let victim_id = victim.id();
    kill(pid_of(victim.pid().unwrap()), Signal::SIGKILL).unwrap();

    supervise_until(&mut cluster, |c| {
        c.pool().worker(victim_id).is_none() && c.pool().started_count() == 3
    })
    .await;

    let ids: Vec<WorkerId> = cluster.pool().workers().iter().map(|w| w.id()).collect();
    assert_eq!(cluster.pool().live_count(), 3);
    assert!(!ids.contains(&victim_id));
    assert!(ids.contains(&WorkerId(4)));

    let snapshot = cluster.metrics().snapshot();
    assert_eq!(snapshot.workers_started, 4);
    assert_eq!(snapshot.workers_exited, 1);
    assert_eq!(snapshot.restarts, 1);

    cluster.shutdown(false).await;
}

// ==================== Heartbeat Tests ====================

#[tokio::test]
#[serial]
async fn test_heartbeat_is_answered_with_matching_ping() {
    let mut cluster = cluster(1);
    let mut events = cluster.subscribe();
    let id = cluster.fork().unwrap();
    let worker = cluster.pool().worker(id).unwrap();
    let pid = worker.pid().unwrap();
    let before = worker.updated_at().unwrap();

    cluster.pool_mut().heartbeat(pid).unwrap();

    let mut seen = Vec::new();
    supervise_until(&mut cluster, |_| {
        seen.extend(drain_events(&mut events));
        seen.iter()
            .any(|e| matches!(e, ClusterEvent::Ping { worker_id, .. } if *worker_id == id))
    })
    .await;

    let after = cluster.pool().worker(id).unwrap().updated_at().unwrap();
    assert!(after > before);
    assert!(cluster.metrics().snapshot().commands_received >= 1);

    cluster.shutdown(false).await;
}

// ==================== Close Tests ====================

#[tokio::test]
#[serial]
async fn test_graceful_close_lets_worker_exit_cleanly() {
    let mut cluster = cluster(2);
    cluster.start().unwrap();
    let mut events = cluster.subscribe();

    let exited = tokio::time::timeout(DEADLINE, cluster.shutdown(true))
        .await
        .unwrap();

    assert_eq!(exited.len(), 2);
    for worker in &exited {
        assert_eq!(worker.state(), WorkerState::Terminated);
        assert_eq!(worker.exit_status(), Some(ExitStatus::Exited { code: 0 }));
    }
    assert_eq!(cluster.metrics().snapshot().forced_kills, 0);

    let closes: Vec<bool> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ClusterEvent::WorkerClose { graceful, .. } => Some(graceful),
            _ => None,
        })
        .collect();
    assert_eq!(closes, vec![true, true]);
}

#[tokio::test]
#[serial]
async fn test_forceful_close_kills_without_waiting() {
    let mut cluster = cluster(1);
    let id = cluster.fork().unwrap();

    assert_eq!(cluster.pool_mut().close(false), 1);
    assert_eq!(cluster.pool().worker(id).unwrap().state(), WorkerState::Terminated);

    let exited = tokio::time::timeout(DEADLINE, cluster.pool_mut().wait(true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exited.exit_status(), Some(ExitStatus::Signaled { signal: 9 }));
    assert_eq!(cluster.metrics().snapshot().forced_kills, 1);
}

#[tokio::test]
#[serial]
async fn test_rolling_restart_replaces_every_worker() {
    let mut cluster = cluster(2);
    cluster.start().unwrap();
    let old: Vec<WorkerId> = cluster.pool().workers().iter().map(|w| w.id()).collect();

    let fresh = cluster.reload().unwrap();
    assert_eq!(fresh.len(), 2);
    // New generation is up before the old one is gone
    assert_eq!(cluster.pool().started_count(), 2);
    for id in &old {
        assert_eq!(cluster.pool().worker(*id).unwrap().state(), WorkerState::Closing);
    }

    supervise_until(&mut cluster, |c| old.iter().all(|id| c.pool().worker(*id).is_none())).await;
    let ids: Vec<WorkerId> = cluster.pool().workers().iter().map(|w| w.id()).collect();
    assert_eq!(ids, fresh);

    cluster.shutdown(false).await;
}

// ==================== Listen Tests ====================

async fn echo_once(address: SocketAddr, line: &str) -> String {
    let attempt = async {
        loop {
            if let Ok(stream) = TcpStream::connect(address).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    let mut stream = tokio::time::timeout(DEADLINE, attempt).await.unwrap();
    stream.write_all(format!("{line}\n").as_bytes()).await.unwrap();

    let mut reply = String::new();
    tokio::time::timeout(DEADLINE, BufReader::new(stream).read_line(&mut reply))
        .await
        .unwrap()
        .unwrap();
    reply
}

#[tokio::test]
#[serial]
async fn test_listen_after_start_moves_running_workers_onto_the_address() {
    let mut cluster = cluster_with(2, echo_main(true));
    cluster.start().unwrap();
    let old: Vec<WorkerId> = cluster.pool().workers().iter().map(|w| w.id()).collect();

    let address = cluster.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    for id in &old {
        assert_eq!(cluster.pool().worker(*id).unwrap().state(), WorkerState::Closing);
    }

    supervise_until(&mut cluster, |c| old.iter().all(|id| c.pool().worker(*id).is_none())).await;
    assert_eq!(cluster.pool().started_count(), 2);
    assert_eq!(echo_once(address, "hello").await, "hello\n");

    cluster.shutdown(true).await;
    std::env::remove_var(LISTEN_ENV);
}

// ABOUTME: Integration tests for workers launched as subprocesses of the prefork binary

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use prefork::cluster::Role;
use prefork::command::Command;
use prefork::events::{ClusterEvent, EventBus};
use prefork::metrics::ClusterMetrics;
use prefork::pool::{PoolSettings, WorkerPool};
use prefork::worker::subprocess::SubprocessBackend;
use prefork::worker::{Backend, ExitStatus, RuntimeSettings, WorkerId, WorkerIds, WorkerState};

const DEADLINE: Duration = Duration::from_secs(15);

fn pool(capacity: usize) -> WorkerPool {
    let settings = RuntimeSettings::default();
    let backend = Backend::Subprocess(SubprocessBackend::new(
        env!("CARGO_BIN_EXE_prefork"),
        vec!["serve".to_string()],
        settings,
    ));
    WorkerPool::new(
        PoolSettings {
            capacity,
            poll_interval: Duration::from_millis(20),
            ..PoolSettings::default()
        },
        backend,
        Role::Primary,
        EventBus::default(),
        Arc::new(ClusterMetrics::new()),
    )
    .unwrap()
}

/// Dispatch worker messages until an event matching `wanted` is published.
async fn dispatch_until(
    pool: &mut WorkerPool,
    events: &mut broadcast::Receiver<ClusterEvent>,
    wanted: impl Fn(&ClusterEvent) -> bool,
) -> ClusterEvent {
    tokio::time::timeout(DEADLINE, async {
        loop {
            while let Ok(event) = events.try_recv() {
                if wanted(&event) {
                    return event;
                }
            }
            let (id, inbound) = pool.recv_inbound().await.unwrap();
            pool.dispatch(id, inbound);
        }
    })
    .await
    .expect("event not observed in time")
}

#[tokio::test]
async fn test_subprocess_worker_answers_heartbeat_and_status() {
    let mut pool = pool(1);
    let mut events = pool.events().subscribe();
    let worker = pool.start(WorkerId(1)).unwrap();
    let pid = worker.pid().unwrap();
    let before = worker.updated_at().unwrap();

    pool.heartbeat(pid).unwrap();
    dispatch_until(&mut pool, &mut events, |e| {
        matches!(e, ClusterEvent::Ping { worker_id: WorkerId(1), .. })
    })
    .await;
    assert!(pool.worker(WorkerId(1)).unwrap().updated_at().unwrap() > before);

    pool.send(WorkerId(1), &Command::Status { status: None }).unwrap();
    let event = dispatch_until(&mut pool, &mut events, |e| matches!(e, ClusterEvent::Status { .. })).await;
    let ClusterEvent::Status { worker_id, status } = event else {
        unreachable!();
    };
    assert_eq!(worker_id, WorkerId(1));
    assert_eq!(status.pid, pid);

    pool.send(WorkerId(1), &Command::Message { text: "hi".into() }).unwrap();
    pool.send(WorkerId(1), &Command::Ping { worker_id: WorkerId(1) }).unwrap();
    dispatch_until(&mut pool, &mut events, |e| matches!(e, ClusterEvent::Pong { .. })).await;

    pool.shutdown(false).await;
}

#[tokio::test]
async fn test_subprocess_worker_closes_gracefully_over_stdio() {
    let mut pool = pool(1);
    pool.start(WorkerId(1)).unwrap();

    assert_eq!(pool.close(true), 1);
    assert_eq!(pool.worker(WorkerId(1)).unwrap().state(), WorkerState::Closing);

    let exited = tokio::time::timeout(DEADLINE, pool.wait(true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exited.id(), WorkerId(1));
    assert_eq!(exited.exit_status(), Some(ExitStatus::Exited { code: 0 }));
    assert_eq!(pool.metrics().snapshot().forced_kills, 0);
}

#[tokio::test]
async fn test_subprocess_pool_replaces_crashed_worker() {
    let mut pool = pool(2);
    let mut ids = WorkerIds::new();
    assert_eq!(pool.replenish(&mut ids).unwrap(), 2);

    let pid = pool.worker(WorkerId(1)).unwrap().pid().unwrap();
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(i32::try_from(pid).unwrap()),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    let exited = tokio::time::timeout(DEADLINE, pool.wait(true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exited.id(), WorkerId(1));

    tokio::time::timeout(DEADLINE, async {
        while pool.replenish(&mut ids).unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(pool.started_count(), 2);
    assert!(pool.worker(WorkerId(3)).is_some());

    pool.shutdown(false).await;
}

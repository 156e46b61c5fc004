// ABOUTME: CLI serve command: a cluster of line-echo TCP workers on one shared port
//
// The primary reserves the listen address, forks the workers and supervises
// them. Each worker binds the same address with SO_REUSEPORT, echoes every
// line it receives and stops accepting on a graceful close. The pause-accept
// control flag parks the accept loop; the reload flag re-binds the listener.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::ClusterArgs;
use crate::cluster::{listen, Cluster, ClusterContext, Role};
use crate::worker::runtime::{worker_main, WorkerHandle, WorkerMain};
use crate::worker::status::ConnectionGuard;
use crate::worker::{subprocess, BackendKind};

/// Run the command in whichever role this process has.
///
/// Returns the process exit code. Subprocess workers land here too, since
/// they re-execute the binary with the same arguments.
pub fn execute(context: ClusterContext, args: &ClusterArgs, runtime: &Runtime) -> Result<i32> {
    let config = args.resolve()?;
    let main = echo_main(config.shares_port());

    match context.role() {
        Role::Worker(id) => {
            if config.backend.resolve() != BackendKind::Subprocess {
                warn!(worker_id = %id, backend = %config.backend, "Worker marker set outside a subprocess backend");
            }
            Ok(runtime.block_on(subprocess::run_worker(id, config.runtime_settings(), main)))
        }
        Role::Primary => {
            runtime.block_on(async {
                let mut cluster = Cluster::new(context, config, main)?;
                if let Some(address) = cluster.config().listen {
                    let resolved = cluster.listen(address)?;
                    info!(address = %resolved, "Workers will accept on shared address");
                }
                cluster.run().await.context("Cluster supervision failed")
            })?;
            Ok(0)
        }
    }
}

/// Worker main serving the line-echo protocol on the shared address.
#[must_use]
pub fn echo_main(reuse_port: bool) -> WorkerMain {
    worker_main(move |handle: WorkerHandle| serve_echo(handle, reuse_port))
}

async fn serve_echo(mut handle: WorkerHandle, reuse_port: bool) -> Result<()> {
    let Some(address) = listen::shared_address() else {
        info!("No listen address configured, idling until closed");
        handle.shutdown_requested().await;
        return Ok(());
    };

    let mut listener = listen::bind(address, reuse_port)
        .with_context(|| format!("Failed to bind shared address {address}"))?;
    let mut local = listener.local_addr()?;
    handle.set_listening_address(local.to_string());
    info!(address = %local, "Accepting connections");

    let mut pause_watch = handle.clone();
    let mut reload_watch = handle.clone();
    let mut paused = handle.is_accept_paused();
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            () = handle.shutdown_requested() => break,
            now_paused = pause_watch.accept_pause_changed() => {
                if now_paused != paused {
                    info!(paused = now_paused, "Accept loop toggled");
                }
                paused = now_paused;
            }
            () = reload_watch.reload_requested() => {
                listener = rebind(listener, address, reuse_port)?;
                local = listener.local_addr()?;
                handle.set_listening_address(local.to_string());
                info!(address = %local, "Listener re-bound");
            }
            accepted = listener.accept(), if !paused => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    let guard = handle.track_connection(peer.to_string(), local.to_string());
                    connections.spawn(echo_lines(stream, guard, handle.clone()));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }

    drop(listener);
    info!(open = connections.len(), "Stopped accepting, draining connections");
    while let Some(result) = connections.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Connection task failed");
        }
    }
    Ok(())
}

/// Fresh listener on the shared address. Without port reuse the old socket
/// has to be closed first, leaving a short gap.
fn rebind(old: TcpListener, address: SocketAddr, reuse_port: bool) -> Result<TcpListener> {
    let old = reuse_port.then_some(old);
    let fresh = listen::bind(address, reuse_port)
        .with_context(|| format!("Failed to re-bind shared address {address}"))?;
    drop(old);
    Ok(fresh)
}

async fn echo_lines(stream: TcpStream, guard: ConnectionGuard, mut handle: WorkerHandle) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            () = handle.shutdown_requested() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let reply = format!("{line}\n");
                    if let Err(e) = writer.write_all(reply.as_bytes()).await {
                        debug!(connection = %guard.id(), error = %e, "Write failed");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(connection = %guard.id(), error = %e, "Read failed");
                    break;
                }
            },
        }
    }
    let _ = writer.shutdown().await;
    debug!(connection = %guard.id(), "Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, Inbound, StreamChannel};
    use crate::command::{Command, CommandFactory, ControlFlags};
    use crate::worker::runtime::{Shutdown, WorkerRuntime};
    use crate::worker::{RuntimeSettings, WorkerId};
    use serial_test::serial;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    struct EchoWorker {
        address: SocketAddr,
        _reserved: listen::SharedAddress,
        primary: StreamChannel,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        task: JoinHandle<Shutdown>,
    }

    fn launch_echo_worker() -> EchoWorker {
        let reserved = listen::SharedAddress::reserve("127.0.0.1:0".parse().unwrap(), true).unwrap();
        reserved.export();

        let factory = Arc::new(CommandFactory::standard());
        let (near, far) = duplex(4096);
        let (r, w) = tokio::io::split(near);
        let worker_side = StreamChannel::new("primary", r, w, Arc::clone(&factory));
        let (r, w) = tokio::io::split(far);
        let primary = StreamChannel::new("worker", r, w, factory);
        let (tx, inbound) = mpsc::unbounded_channel();
        primary.listen(tx).unwrap();

        let runtime = WorkerRuntime::new(
            WorkerId(1),
            Box::new(worker_side),
            RuntimeSettings::default(),
            echo_main(true),
        );
        EchoWorker {
            address: reserved.address(),
            _reserved: reserved,
            primary,
            inbound,
            task: tokio::spawn(runtime.run()),
        }
    }

    /// Connect once the worker has bound the address.
    async fn connect(address: SocketAddr) -> TcpStream {
        loop {
            if let Ok(stream) = TcpStream::connect(address).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn read_reply(client: &mut TcpStream, within: Duration) -> Option<String> {
        let mut reply = String::new();
        let read = tokio::time::timeout(within, BufReader::new(client).read_line(&mut reply)).await;
        read.ok().map(|result| {
            result.unwrap();
            reply
        })
    }

    async fn echo(client: &mut TcpStream, line: &str) -> String {
        client.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        read_reply(client, Duration::from_secs(5)).await.expect("no echo")
    }

    async fn close_gracefully(worker: EchoWorker) {
        worker.primary.send(&Command::Close { graceful: true }).unwrap();
        let shutdown = tokio::time::timeout(Duration::from_secs(5), worker.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shutdown, Shutdown::Graceful);
    }

    #[tokio::test]
    #[serial(listen_env)]
    async fn test_echo_worker_serves_and_drains() {
        let mut worker = launch_echo_worker();
        let mut client = connect(worker.address).await;
        assert_eq!(echo(&mut client, "hello").await, "hello\n");

        worker
            .primary
            .send(&Command::ConnectionsQuery { worker_id: WorkerId(1) })
            .unwrap();
        let answer = tokio::time::timeout(Duration::from_secs(5), worker.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        match answer {
            Inbound::Command(Command::Connections { connections }) => {
                assert_eq!(connections.len(), 1);
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        close_gracefully(worker).await;
    }

    #[tokio::test]
    #[serial(listen_env)]
    async fn test_paused_worker_leaves_new_connections_waiting() {
        let worker = launch_echo_worker();
        let mut established = connect(worker.address).await;
        assert_eq!(echo(&mut established, "first").await, "first\n");

        worker
            .primary
            .send(&Command::Control {
                flags: ControlFlags::PAUSE_ACCEPT,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The kernel completes the handshake but nobody accepts it
        let mut waiting = TcpStream::connect(worker.address).await.unwrap();
        waiting.write_all(b"queued\n").await.unwrap();
        assert_eq!(read_reply(&mut waiting, Duration::from_millis(300)).await, None);

        // Open connections keep being served while paused
        assert_eq!(echo(&mut established, "still here").await, "still here\n");

        worker
            .primary
            .send(&Command::Control {
                flags: ControlFlags::default(),
            })
            .unwrap();
        assert_eq!(
            read_reply(&mut waiting, Duration::from_secs(5)).await.as_deref(),
            Some("queued\n")
        );

        close_gracefully(worker).await;
    }

    #[tokio::test]
    #[serial(listen_env)]
    async fn test_reload_rebinds_listener_on_same_address() {
        let mut worker = launch_echo_worker();
        let mut before = connect(worker.address).await;
        assert_eq!(echo(&mut before, "before").await, "before\n");

        worker
            .primary
            .send(&Command::Control {
                flags: ControlFlags::RELOAD,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut after = connect(worker.address).await;
        assert_eq!(echo(&mut after, "after").await, "after\n");

        worker.primary.send(&Command::Status { status: None }).unwrap();
        match tokio::time::timeout(Duration::from_secs(5), worker.inbound.recv()).await {
            Ok(Some(Inbound::Command(Command::WorkerStatus { status, .. }))) => {
                assert_eq!(status.listening_address, Some(worker.address.to_string()));
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        close_gracefully(worker).await;
    }
}

// ABOUTME: Library crate for prefork: a primary process supervising a pool of workers
// ABOUTME: that share a listening socket and talk to it over a framed control channel

#![allow(missing_docs)]

#[cfg(not(unix))]
compile_error!("prefork relies on fork(2), POSIX signals and SO_REUSEPORT and only builds on unix");

pub mod channel;
pub mod cli;
pub mod cluster;
pub mod command;
pub mod config;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod worker;

pub use cluster::{Cluster, ClusterContext, ClusterError, Role};
pub use command::Command;
pub use config::ClusterConfig;
pub use events::{ClusterEvent, EventBus};
pub use worker::runtime::{worker_main, WorkerHandle, WorkerMain};
pub use worker::{BackendKind, WorkerId, WorkerState};

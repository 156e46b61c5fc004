// ABOUTME: CLI argument parsing and command routing for prefork
//
// Provides command-line interface for:
// - Running a cluster of line-echo workers on a shared port (serve)
// - Printing the effective configuration (config)

pub mod config;
pub mod serve;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::ClusterConfig;
use crate::logging::LogFormat;
use crate::worker::BackendKind;

/// Prefork process supervisor
#[derive(Debug, Parser)]
#[command(name = "prefork")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Write logs to a timestamped file in this directory instead of stderr
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a cluster of echo workers sharing one port
    Serve(ClusterArgs),

    /// Print the effective configuration as TOML
    Config(ClusterArgs),
}

/// Configuration source and overrides shared by every command
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ClusterArgs {
    /// TOML config file (default: <config dir>/prefork/prefork.toml if present)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Number of workers
    #[arg(long, short)]
    pub workers: Option<usize>,

    /// Worker backend
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Address every worker accepts on
    #[arg(long, short)]
    pub listen: Option<SocketAddr>,
}

impl ClusterArgs {
    /// Config file values with command-line overrides applied.
    pub fn resolve(&self) -> Result<ClusterConfig> {
        let mut config = ClusterConfig::load_or_default(self.config.as_deref())
            .context("Failed to load configuration")?;

        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(listen) = self.listen {
            config.listen = Some(listen);
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

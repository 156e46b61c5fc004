// ABOUTME: Tracing subscriber setup shared by the primary and its workers
//
// Logs go to stderr or to a timestamped JSONL file, never to stdout: stdout is
// the control channel of subprocess workers.

use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::ValueEnum;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Default directive when RUST_LOG is unset
pub const DEFAULT_FILTER: &str = "prefork=info";

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    /// JSON Lines
    Json,
}

/// File name for a log file opened at `now`.
#[must_use]
pub fn log_file_name(now: DateTime<Local>) -> String {
    format!("prefork-{}.jsonl", now.format("%Y%m%d-%H%M%S"))
}

/// Install the global subscriber.
///
/// With `log_dir`, logs are appended to a new timestamped file inside it and
/// the file path is returned. Forked workers inherit the subscriber; worker
/// processes started as subprocesses call this again with the same arguments.
pub fn setup_logging(format: LogFormat, log_dir: Option<&Path>) -> Result<Option<PathBuf>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (writer, log_file, ansi) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let path = dir.join(log_file_name(Local::now()));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            (BoxMakeWriter::new(file), Some(path), false)
        }
        None => (
            BoxMakeWriter::new(std::io::stderr),
            None,
            std::io::stderr().is_terminal(),
        ),
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(writer)
        .with_ansi(ansi);

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(layer.json()).try_init(),
        LogFormat::Text => registry.with(layer).try_init(),
    }
    .context("Failed to install tracing subscriber")?;

    Ok(log_file)
}

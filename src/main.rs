// ABOUTME: Main entry point for prefork
//
// Binary: prefork
// Usage: prefork [COMMAND]
// - serve: run a supervised cluster of echo workers on a shared port
// - config: print the effective configuration
//
// The same binary is re-executed as a worker by the subprocess backend; the
// role marker in the environment decides which side runs.

#![allow(missing_docs)]

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use prefork::cli::{self, Cli, Commands};
use prefork::cluster::ClusterContext;
use prefork::logging::setup_logging;

fn main() -> ExitCode {
    let args = Cli::parse();

    if let Err(e) = setup_logging(args.log_format, args.log_dir.as_deref()) {
        eprintln!("Failed to set up logging: {e:#}");
        return ExitCode::FAILURE;
    }
    setup_panic_handler();

    match run(args) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => exit_now(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "prefork failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> Result<i32> {
    let context = ClusterContext::detect();

    match args.command {
        Commands::Config(config_args) => cli::config::execute(&config_args).map(|()| 0),
        Commands::Serve(serve_args) => {
            // fork(2) is only sound while the primary has a single thread
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            let code = cli::serve::execute(context, &serve_args, &runtime)?;

            if !context.is_primary() {
                // The stdin reader of a subprocess worker blocks runtime shutdown
                exit_now(code);
            }
            Ok(code)
        }
    }
}

fn exit_now(code: i32) -> ! {
    std::process::exit(code)
}

fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("Process panicked: {}", panic_info);
        default_hook(panic_info);
    }));
}

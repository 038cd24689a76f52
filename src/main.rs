//! echo-fixtures: TCP echo servers for load testing
//!
//! Every byte a client sends is written back unchanged, in order, until the
//! client closes the connection. No framing, no state.
//!
//! Shapes:
//! - Single process (default): one listener on port 7777
//! - Cluster: a supervisor spawning one worker process per CPU core, all
//!   sharing the port through SO_REUSEPORT
//!
//! Backends: tokio, mio (epoll/kqueue), io_uring (Linux).

mod config;
mod echo;
mod runtime;
mod supervisor;

use config::{Config, Role};
use supervisor::Supervisor;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    // Report startup failures in their readable form and exit non-zero.
    if let Err(e) = try_main() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.role() {
        Role::Supervisor => run_supervisor(config),
        Role::Listener => run_listener(config),
    }
}

/// Spawn the worker processes and wait on them.
fn run_supervisor(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        addr = %config.socket_addr(),
        workers = config.workers,
        runtime = ?config.runtime,
        "Starting echo cluster"
    );

    Supervisor::for_current_exe(&config)?.run()?;
    Ok(())
}

/// Bind the port and echo until the process is killed.
fn run_listener(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        addr = %config.socket_addr(),
        runtime = ?config.runtime,
        threads = config.threads,
        worker = ?config.worker_id,
        "Starting echo server"
    );

    runtime::run(config)?;
    Ok(())
}

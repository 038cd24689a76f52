//! Echo runtimes.
//!
//! Backends:
//! - `tokio`: one task per connection, on a current-thread or
//!   multi-thread runtime
//! - `mio`: readiness-based loop per thread (epoll on Linux, kqueue on macOS)
//! - `uring`: completion-based loop per thread (Linux only)
//!
//! The two event loop backends share common abstractions:
//! - `BufferPool`: Per-thread buffer management
//! - `ConnState`: Connection echo state machine

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod buffer;
#[cfg(any(target_os = "linux", target_os = "macos"))]
mod connection;
pub mod listener;
mod tokio_impl;

#[cfg(test)]
mod test_support;

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod mio_impl;

#[cfg(target_os = "linux")]
mod uring;

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub(crate) use buffer::BufferPool;
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub(crate) use connection::ConnState;

use crate::config::{Config, RuntimeType};
use std::io;

/// Run the echo server with the configured backend.
///
/// Only returns on startup failure; once listening, the server runs until
/// the process is terminated.
pub fn run(config: Config) -> io::Result<()> {
    match config.runtime {
        RuntimeType::Tokio => tokio_impl::run(config),
        RuntimeType::Mio => run_mio(config),
        RuntimeType::IoUring => run_uring(config),
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn run_mio(config: Config) -> io::Result<()> {
    run_threads(&config, "mio", mio_impl::worker_loop)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn run_mio(_config: Config) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "mio runtime is only supported on Linux and macOS",
    ))
}

#[cfg(target_os = "linux")]
fn run_uring(config: Config) -> io::Result<()> {
    // Check once so an unsupported kernel fails startup instead of every thread.
    uring::setup_ring(uring::RING_SIZE)?;
    run_threads(&config, "io_uring", uring::worker_loop)
}

#[cfg(not(target_os = "linux"))]
fn run_uring(_config: Config) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "io_uring runtime is only supported on Linux",
    ))
}

/// Thread-per-core driver for the event loop backends.
///
/// Each thread binds its own SO_REUSEPORT listener so the kernel balances
/// connections between them. Binding happens before any thread starts, so a
/// port conflict is reported to the caller.
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn run_threads(
    config: &Config,
    backend: &'static str,
    worker_loop: fn(usize, std::net::TcpListener, usize) -> io::Result<()>,
) -> io::Result<()> {
    use std::thread;
    use tracing::{error, info, warn};

    let addr = config.socket_addr();
    let num_threads = config.threads;

    info!(
        threads = num_threads,
        addr = %addr,
        backend,
        "Starting event loop runtime"
    );

    let listeners = (0..num_threads)
        .map(|_| listener::create_listener(addr, config.backlog))
        .collect::<io::Result<Vec<_>>>()?;

    let mut handles = Vec::with_capacity(num_threads);

    for (thread_id, listener) in listeners.into_iter().enumerate() {
        let buffer_size = config.buffer_size;
        let pin = config.pin_threads.then(|| config.pin_index(thread_id));

        let handle = thread::Builder::new()
            .name(format!("io-{thread_id}"))
            .spawn(move || {
                if let Some(cpu) = pin {
                    if let Err(e) = listener::pin_current_thread(cpu) {
                        warn!(thread = thread_id, cpu, error = %e, "Failed to pin thread");
                    }
                }
                if let Err(e) = worker_loop(thread_id, listener, buffer_size) {
                    error!(thread = thread_id, error = %e, "Event loop failed");
                }
            })?;

        handles.push(handle);
    }

    // Wait for all threads
    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

/// Number of CPUs available to this process.
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

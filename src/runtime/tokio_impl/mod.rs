//! Tokio backend: one accept loop, one task per connection.
//!
//! With a single thread this runs on a current-thread runtime, so the whole
//! process is one event-driven thread. With more threads the accept loop and
//! the connection tasks share a multi-thread runtime.

use crate::config::Config;
use crate::echo::echo;
use crate::runtime::listener::create_listener;
use std::io;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Run the tokio-based server.
pub fn run(config: Config) -> io::Result<()> {
    let runtime = if config.threads == 1 {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
    } else {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.threads)
            .enable_all()
            .build()?
    };

    let addr = config.socket_addr();
    let listener = create_listener(addr, config.backlog)?;

    info!(
        threads = config.threads,
        addr = %addr,
        "Starting tokio runtime"
    );

    runtime.block_on(async move {
        let listener = TcpListener::from_std(listener)?;
        serve(listener, config.buffer_size).await
    })
}

/// Accept connections forever, echoing each one on its own task.
pub async fn serve(listener: TcpListener, buffer_size: usize) -> io::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Accepted connection");
                tokio::spawn(handle_connection(stream, buffer_size));
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

/// Echo a single client connection until it closes or fails.
async fn handle_connection(mut stream: TcpStream, buffer_size: usize) {
    match echo(&mut stream, buffer_size).await {
        Ok(bytes) => debug!(bytes, "Connection closed"),
        Err(e) => debug!(error = %e, "Connection error"),
    }
}

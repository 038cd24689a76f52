//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Each connection owns one pool buffer. A chunk read into it is written
//! back completely before the next read; on a short write the connection
//! switches its interest to writable until the chunk is drained.

use crate::runtime::{BufferPool, ConnState};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Events drained per poll call.
const EVENTS_CAPACITY: usize = 1024;

/// Connections (and buffers) pre-allocated per thread.
const INITIAL_CONNECTIONS: usize = 1024;

/// Per-thread connection state for mio backend.
struct MioConnection {
    stream: TcpStream,
    state: ConnState,
    /// Buffer holding the chunk being echoed.
    buf_idx: usize,
    /// Interest currently registered with the poller.
    interest: Interest,
}

/// Run one event loop thread on `listener` forever.
pub fn worker_loop(
    thread_id: usize,
    listener: std::net::TcpListener,
    buffer_size: usize,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut buffers = BufferPool::new(INITIAL_CONNECTIONS, buffer_size);
    let mut connections: Slab<MioConnection> = Slab::with_capacity(INITIAL_CONNECTIONS);

    info!(thread = thread_id, buffer_size, "Event loop started");

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(&listener, poll.registry(), &mut connections, &mut buffers)?;
                }
                Token(conn_id) => {
                    let Some(conn) = connections.get_mut(conn_id) else {
                        continue;
                    };

                    match drive(conn, &mut buffers, poll.registry(), Token(conn_id)) {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(conn_id, "Connection closed by peer");
                            close_connection(poll.registry(), &mut connections, &mut buffers, conn_id);
                        }
                        Err(e) => {
                            debug!(conn_id, error = %e, "Connection error");
                            close_connection(poll.registry(), &mut connections, &mut buffers, conn_id);
                        }
                    }
                }
            }
        }
    }
}

fn accept_connections(
    listener: &TcpListener,
    registry: &Registry,
    connections: &mut Slab<MioConnection>,
    buffers: &mut BufferPool,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => match insert_connection(registry, connections, buffers, stream) {
                Ok(conn_id) => debug!(conn_id, peer = %peer_addr, "Accepted connection"),
                // The stream was dropped, which closes it; the listener carries on.
                Err(e) => warn!(peer = %peer_addr, error = %e, "Failed to register connection"),
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Accept error");
                break;
            }
        }
    }
    Ok(())
}

/// Register an accepted stream and give it a buffer.
fn insert_connection(
    registry: &Registry,
    connections: &mut Slab<MioConnection>,
    buffers: &mut BufferPool,
    mut stream: TcpStream,
) -> io::Result<usize> {
    let entry = connections.vacant_entry();
    let conn_id = entry.key();

    registry.register(&mut stream, Token(conn_id), Interest::READABLE)?;

    entry.insert(MioConnection {
        stream,
        state: ConnState::Reading,
        buf_idx: buffers.alloc(),
        interest: Interest::READABLE,
    });
    Ok(conn_id)
}

/// Echo as much as the socket allows without blocking.
///
/// Returns `Ok(false)` once the peer has closed its side.
fn drive(
    conn: &mut MioConnection,
    buffers: &mut BufferPool,
    registry: &Registry,
    token: Token,
) -> io::Result<bool> {
    loop {
        if !flush(conn, buffers)? {
            set_interest(conn, registry, token, Interest::WRITABLE)?;
            return Ok(true);
        }

        let buf = buffers.get_mut(conn.buf_idx);
        match conn.stream.read(buf) {
            Ok(0) => return Ok(false),
            Ok(n) => conn.state = ConnState::Writing { written: 0, total: n },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                set_interest(conn, registry, token, Interest::READABLE)?;
                return Ok(true);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write the pending part of the connection's chunk.
///
/// Returns `Ok(false)` if the socket would block before the chunk is drained.
fn flush(conn: &mut MioConnection, buffers: &BufferPool) -> io::Result<bool> {
    loop {
        let pending = conn.state.pending();
        if pending.is_empty() {
            conn.state = ConnState::Reading;
            return Ok(true);
        }

        match conn.stream.write(&buffers.get(conn.buf_idx)[pending]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => {
                conn.state.advance(n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn set_interest(
    conn: &mut MioConnection,
    registry: &Registry,
    token: Token,
    interest: Interest,
) -> io::Result<()> {
    if conn.interest != interest {
        registry.reregister(&mut conn.stream, token, interest)?;
        conn.interest = interest;
    }
    Ok(())
}

fn close_connection(
    registry: &Registry,
    connections: &mut Slab<MioConnection>,
    buffers: &mut BufferPool,
    conn_id: usize,
) {
    if let Some(mut conn) = connections.try_remove(conn_id) {
        let _ = registry.deregister(&mut conn.stream);
        buffers.free(conn.buf_idx);
    }
}

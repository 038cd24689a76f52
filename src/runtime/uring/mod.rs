//! Linux io_uring event loop implementation.
//!
//! Completion-based model: submit operations to the ring, then process
//! completions in batches. Every connection has exactly one operation in
//! flight at a time (a recv into its buffer, or a send of the chunk it
//! holds), so its buffer is never touched by two operations at once.
//!
//! A failed submission for one connection closes that connection only.
//! Failing to re-arm accept stops the loop, since the ring itself is broken.
//!
//! Requires the fast poll feature (kernel 5.7+) so that accept and recv on
//! sockets without pending data are armed internally by the kernel instead
//! of punted to worker threads.

mod connection;
mod token;

use crate::runtime::BufferPool;
use connection::{Connection, ConnectionRegistry};
use io_uring::{opcode, squeue, types, IoUring};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use token::{OpType, TokenAllocator};
use tracing::{debug, info, warn};

/// Submission queue entries per ring.
pub const RING_SIZE: u32 = 4096;

/// Connections (and buffers) pre-allocated per thread.
const INITIAL_CONNECTIONS: usize = 1024;

/// Create a ring and check that the kernel supports fast poll.
pub fn setup_ring(entries: u32) -> io::Result<IoUring> {
    let ring = IoUring::new(entries)?;
    if !ring.params().is_feature_fast_poll() {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "io_uring fast poll not supported, kernel 5.7+ required",
        ));
    }
    Ok(ring)
}

/// Run one event loop thread on `listener` forever.
pub fn worker_loop(
    thread_id: usize,
    listener: std::net::TcpListener,
    buffer_size: usize,
) -> io::Result<()> {
    // Recv and send lengths are u32; anything up to a full buffer must fit.
    if u32::try_from(buffer_size).is_err() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "buffer size does not fit an io_uring length",
        ));
    }

    let mut ring = setup_ring(RING_SIZE)?;

    // The listener stays owned here; only its fd goes into the ring, which
    // polls it internally.
    listener.set_nonblocking(false)?;
    let listener_fd = listener.as_raw_fd();

    let mut buffers = BufferPool::new(INITIAL_CONNECTIONS, buffer_size);
    let mut connections = ConnectionRegistry::new(INITIAL_CONNECTIONS);
    let mut tokens = TokenAllocator::new(INITIAL_CONNECTIONS + 1);

    submit_accept(&mut ring, &mut tokens, listener_fd)?;

    info!(
        thread = thread_id,
        ring_size = RING_SIZE,
        buffer_size,
        "Event loop started"
    );

    loop {
        // Submit pending operations and wait for at least one completion
        if let Err(e) = ring.submit_and_wait(1) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        loop {
            let cqe = match ring.completion().next() {
                Some(cqe) => cqe,
                None => break,
            };

            let token = cqe.user_data();
            let result = cqe.result();

            let op = match tokens.free(token) {
                Some(op) => op,
                None => {
                    warn!(token, "Unknown token in completion");
                    continue;
                }
            };

            match op {
                OpType::Accept => {
                    handle_accept(
                        result,
                        &mut ring,
                        &mut tokens,
                        &mut connections,
                        &mut buffers,
                        listener_fd,
                    )?;
                }
                OpType::Read { conn_id } => {
                    handle_read(
                        result,
                        conn_id,
                        &mut ring,
                        &mut tokens,
                        &mut connections,
                        &mut buffers,
                    );
                }
                OpType::Write { conn_id } => {
                    handle_write(
                        result,
                        conn_id,
                        &mut ring,
                        &mut tokens,
                        &mut connections,
                        &mut buffers,
                    );
                }
            }
        }
    }
}

fn handle_accept(
    result: i32,
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &mut ConnectionRegistry,
    buffers: &mut BufferPool,
    listener_fd: RawFd,
) -> io::Result<()> {
    // Always re-arm accept
    submit_accept(ring, tokens, listener_fd)?;

    if result < 0 {
        let err = io::Error::from_raw_os_error(-result);
        warn!(error = %err, "Accept failed");
        return Ok(());
    }

    let client_fd = result;
    let conn_id = connections.insert(Connection::new(client_fd, buffers.alloc()));

    debug!(conn_id, fd = client_fd, "Accepted connection");

    let submitted = submit_read(ring, tokens, connections, buffers, conn_id);
    close_on_error(submitted, conn_id, connections, buffers);
    Ok(())
}

fn handle_read(
    result: i32,
    conn_id: usize,
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &mut ConnectionRegistry,
    buffers: &mut BufferPool,
) {
    if result <= 0 {
        if result < 0 {
            let err = io::Error::from_raw_os_error(-result);
            debug!(conn_id, error = %err, "Read error");
        } else {
            debug!(conn_id, "Connection closed by peer");
        }
        close_connection(connections, buffers, conn_id);
        return;
    }

    let Some(conn) = connections.get_mut(conn_id) else {
        return;
    };
    conn.start_writing(result as usize);

    let submitted = submit_write(ring, tokens, connections, buffers, conn_id);
    close_on_error(submitted, conn_id, connections, buffers);
}

fn handle_write(
    result: i32,
    conn_id: usize,
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &mut ConnectionRegistry,
    buffers: &mut BufferPool,
) {
    if result <= 0 {
        if result < 0 {
            let err = io::Error::from_raw_os_error(-result);
            debug!(conn_id, error = %err, "Write error");
        }
        close_connection(connections, buffers, conn_id);
        return;
    }

    let Some(conn) = connections.get_mut(conn_id) else {
        return;
    };

    let submitted = if conn.state.advance(result as usize) {
        submit_read(ring, tokens, connections, buffers, conn_id)
    } else {
        // Short write, send the rest of the chunk
        submit_write(ring, tokens, connections, buffers, conn_id)
    };
    close_on_error(submitted, conn_id, connections, buffers);
}

fn submit_accept(
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    listener_fd: RawFd,
) -> io::Result<()> {
    let token = tokens.alloc(OpType::Accept);

    let accept = opcode::Accept::new(
        types::Fd(listener_fd),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
    )
    .build()
    .user_data(token);

    push(ring, &accept).inspect_err(|_| {
        tokens.free(token);
    })
}

fn submit_read(
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &ConnectionRegistry,
    buffers: &mut BufferPool,
    conn_id: usize,
) -> io::Result<()> {
    let conn = connections
        .get(conn_id)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

    // Fits: checked when the loop started.
    let len = buffers.buffer_size() as u32;
    let buf_ptr = buffers.get_ptr(conn.buf_idx);

    let token = tokens.alloc(OpType::Read { conn_id });

    let recv = opcode::Recv::new(types::Fd(conn.fd), buf_ptr, len)
        .build()
        .user_data(token);

    push(ring, &recv).inspect_err(|_| {
        tokens.free(token);
    })
}

fn submit_write(
    ring: &mut IoUring,
    tokens: &mut TokenAllocator,
    connections: &ConnectionRegistry,
    buffers: &mut BufferPool,
    conn_id: usize,
) -> io::Result<()> {
    let conn = connections
        .get(conn_id)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

    let pending = conn.state.pending();
    if pending.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not in writing state",
        ));
    }

    // Safety: `pending` lies within the connection's buffer.
    let buf_ptr = unsafe { buffers.get_ptr(conn.buf_idx).add(pending.start) };

    let token = tokens.alloc(OpType::Write { conn_id });

    let send = opcode::Send::new(types::Fd(conn.fd), buf_ptr, pending.len() as u32)
        .build()
        .user_data(token);

    push(ring, &send).inspect_err(|_| {
        tokens.free(token);
    })
}

/// Queue an entry, flushing the submission queue to the kernel if it is full.
fn push(ring: &mut IoUring, entry: &squeue::Entry) -> io::Result<()> {
    loop {
        // Safety: every buffer an entry points at is owned by the thread's
        // pool and stays allocated until the entry's completion is handled.
        if unsafe { ring.submission().push(entry) }.is_ok() {
            return Ok(());
        }
        ring.submit()?;
    }
}

/// Close a connection whose next operation could not be queued.
fn close_on_error(
    submitted: io::Result<()>,
    conn_id: usize,
    connections: &mut ConnectionRegistry,
    buffers: &mut BufferPool,
) {
    if let Err(e) = submitted {
        debug!(conn_id, error = %e, "Failed to submit operation");
        close_connection(connections, buffers, conn_id);
    }
}

fn close_connection(
    connections: &mut ConnectionRegistry,
    buffers: &mut BufferPool,
    conn_id: usize,
) {
    if let Some(conn) = connections.remove(conn_id) {
        buffers.free(conn.buf_idx);

        // Close the file descriptor
        unsafe { libc::close(conn.fd) };
    }
}

//! Connections owned by one io_uring event loop.

use crate::runtime::ConnState;
use slab::Slab;
use std::os::unix::io::RawFd;

/// A client socket plus the pool buffer its chunks pass through.
#[derive(Debug)]
pub struct Connection {
    pub fd: RawFd,
    pub state: ConnState,
    pub buf_idx: usize,
}

impl Connection {
    /// New connection, waiting for its first read.
    pub fn new(fd: RawFd, buf_idx: usize) -> Self {
        Self {
            fd,
            state: ConnState::Reading,
            buf_idx,
        }
    }

    /// A recv completed with `total` bytes; they now have to be sent back.
    pub fn start_writing(&mut self, total: usize) {
        self.state = ConnState::Writing { written: 0, total };
    }
}

/// Slab of live connections, keyed by the id carried in operation tokens.
/// Grows past its initial capacity as needed.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: Slab::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, conn: Connection) -> usize {
        self.connections.insert(conn)
    }

    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }
}

//! Connection state machine for echo connections.
//!
//! A connection alternates between reading a chunk from the peer and
//! writing that same chunk back. It does not read again until the whole
//! chunk has been written, which keeps the echoed stream in order.

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for data to be read into the connection buffer.
    Reading,
    /// Echoing data held in the connection buffer.
    Writing {
        /// Bytes already written.
        written: usize,
        /// Total bytes to write.
        total: usize,
    },
}

impl ConnState {
    /// Record `n` more bytes written. Returns true once the chunk is done,
    /// in which case the state is back to `Reading`.
    pub fn advance(&mut self, n: usize) -> bool {
        if let ConnState::Writing { written, total } = self {
            *written += n;
            if *written < *total {
                return false;
            }
        }
        *self = ConnState::Reading;
        true
    }

    /// Bytes of the current chunk not yet written, as a range into the
    /// connection buffer.
    pub fn pending(&self) -> std::ops::Range<usize> {
        match *self {
            ConnState::Reading => 0..0,
            ConnState::Writing { written, total } => written..total,
        }
    }
}

//! user_data tokens for io_uring submissions.
//!
//! A completion only carries the 64-bit user_data it was submitted with;
//! the token maps it back to what was in flight and for which connection.

use slab::Slab;

/// What a submission was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Accept,
    Read { conn_id: usize },
    Write { conn_id: usize },
}

/// Slab-backed token table. Tokens are reused once their completion is
/// taken with `free`.
pub struct TokenAllocator {
    ops: Slab<OpType>,
}

impl TokenAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    pub fn alloc(&mut self, op: OpType) -> u64 {
        self.ops.insert(op) as u64
    }

    /// Take the operation behind a completed token, or `None` if the token
    /// is not outstanding.
    pub fn free(&mut self, token: u64) -> Option<OpType> {
        self.ops.try_remove(token as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_map_back_to_ops() {
        let mut tokens = TokenAllocator::new(4);

        let accept = tokens.alloc(OpType::Accept);
        let read = tokens.alloc(OpType::Read { conn_id: 7 });
        let write = tokens.alloc(OpType::Write { conn_id: 7 });

        assert_eq!(tokens.free(write), Some(OpType::Write { conn_id: 7 }));
        assert_eq!(tokens.free(read), Some(OpType::Read { conn_id: 7 }));
        assert_eq!(tokens.free(accept), Some(OpType::Accept));
        assert_eq!(tokens.free(accept), None);
    }

    #[test]
    fn test_freed_token_is_reused() {
        let mut tokens = TokenAllocator::new(1);
        let first = tokens.alloc(OpType::Accept);
        tokens.free(first);
        assert_eq!(tokens.alloc(OpType::Read { conn_id: 0 }), first);
    }
}

//! Operation token tracking for io_uring completion correlation.
//!
//! Each submitted operation gets a unique token (user_data) that identifies
//! the operation type and the connection it belongs to when the completion
//! arrives, possibly out of submission order.

use slab::Slab;
use std::os::unix::io::RawFd;

/// Type of in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Accept operation on listener socket.
    Accept,
    /// Request read on a connection.
    Read {
        /// Descriptor the connection is registered under.
        fd: RawFd,
        /// Identity of the owner at submission time; a mismatch means the
        /// descriptor now belongs to someone else.
        client: u64,
    },
    /// Vectored response write on a connection.
    Write { fd: RawFd, client: u64 },
    /// Cancellation of an idle connection's pending operation.
    Cancel,
}

/// Allocator for operation tokens with O(1) lookup.
///
/// Uses a slab to efficiently allocate and deallocate tokens,
/// providing stable identifiers for in-flight operations.
pub struct TokenAllocator {
    ops: Slab<OpType>,
}

impl TokenAllocator {
    /// Create a new token allocator with specified capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    /// Allocate a new token for an operation.
    ///
    /// Returns the token (user_data value for io_uring).
    pub fn alloc(&mut self, op: OpType) -> u64 {
        self.ops.insert(op) as u64
    }

    /// Get the operation type for a token.
    #[cfg(test)]
    pub fn get(&self, token: u64) -> Option<OpType> {
        self.ops.get(token as usize).copied()
    }

    /// Free a token, making it available for reuse.
    ///
    /// Returns the operation type that was associated with the token.
    pub fn free(&mut self, token: u64) -> Option<OpType> {
        self.ops.try_remove(token as usize)
    }

    /// Number of currently allocated tokens.
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_allocator() {
        let mut alloc = TokenAllocator::new(16);

        let t1 = alloc.alloc(OpType::Accept);
        let t2 = alloc.alloc(OpType::Read { fd: 5, client: 1 });

        assert_eq!(alloc.len(), 2);
        assert_eq!(alloc.get(t1), Some(OpType::Accept));
        assert_eq!(alloc.get(t2), Some(OpType::Read { fd: 5, client: 1 }));

        // Free and verify
        assert_eq!(alloc.free(t1), Some(OpType::Accept));
        assert!(alloc.get(t1).is_none());
        assert!(alloc.free(t1).is_none());
        assert_eq!(alloc.len(), 1);

        // Slab reuses slots
        let t3 = alloc.alloc(OpType::Write { fd: 5, client: 1 });
        assert_eq!(t3, t1);
    }

    #[test]
    fn test_unknown_token() {
        let mut alloc = TokenAllocator::new(4);
        assert!(alloc.free(u64::MAX).is_none());
        assert!(alloc.get(42).is_none());
    }
}

//! Poll token tracking for readiness dispatch.
//!
//! Each registered socket gets a unique `mio::Token` that identifies its
//! owner when a readiness event arrives.

use crate::runtime::connection::Side;
use mio::Token;
use slab::Slab;

/// What a registered socket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOwner {
    /// The listening socket.
    Listener,
    /// One endpoint of a connection.
    Endpoint {
        /// Connection key in the registry.
        conn: usize,
        side: Side,
    },
}

/// Allocator for poll tokens with O(1) lookup.
///
/// Uses a slab to efficiently allocate and deallocate tokens,
/// providing stable identifiers for registered sockets.
pub struct TokenAllocator {
    owners: Slab<TokenOwner>,
}

impl TokenAllocator {
    /// Create a new token allocator with specified capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            owners: Slab::with_capacity(capacity),
        }
    }

    /// Allocate a new token for a socket.
    pub fn alloc(&mut self, owner: TokenOwner) -> Token {
        Token(self.owners.insert(owner))
    }

    /// Get the owner of a token.
    ///
    /// Returns None if the token is invalid or already freed.
    pub fn get(&self, token: Token) -> Option<TokenOwner> {
        self.owners.get(token.0).copied()
    }

    /// Free a token, making it available for reuse.
    ///
    /// Returns the owner that was associated with the token.
    pub fn free(&mut self, token: Token) -> Option<TokenOwner> {
        self.owners.try_remove(token.0)
    }

    /// Number of currently allocated tokens.
    pub fn len(&self) -> usize {
        self.owners.len()
    }
}

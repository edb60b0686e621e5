//! Connection id allocation.

use super::{ConnectionId, HOST_CONNECTION_ID};
use std::collections::BTreeSet;

/// Allocates connection ids monotonically, reusing released ids first
/// (smallest released id wins). Id 0 is reserved for the host peer and is
/// never handed out.
///
/// The pool itself is not synchronized; managers keep it behind their own
/// mutex. An id must only be released after the connection's teardown events
/// have been dispatched, otherwise a late event could reach a fresh
/// connection that happens to reuse the id.
pub struct IdPool {
    next: ConnectionId,
    released: BTreeSet<ConnectionId>,
}

impl IdPool {
    pub fn new() -> Self {
        Self {
            next: HOST_CONNECTION_ID + 1,
            released: BTreeSet::new(),
        }
    }

    /// Hands out the smallest available id.
    pub fn allocate(&mut self) -> ConnectionId {
        if let Some(id) = self.released.pop_first() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    /// Returns an id to the pool for reuse.
    pub fn release(&mut self, id: ConnectionId) {
        if id != HOST_CONNECTION_ID && id < self.next {
            self.released.insert(id);
        }
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_after_the_host_id() {
        let mut pool = IdPool::new();
        assert_eq!(pool.allocate(), 1);
        assert_eq!(pool.allocate(), 2);
        assert_eq!(pool.allocate(), 3);
    }

    #[test]
    fn released_ids_are_reused_smallest_first() {
        let mut pool = IdPool::new();
        for _ in 0..4 {
            pool.allocate();
        }
        pool.release(3);
        pool.release(1);
        assert_eq!(pool.allocate(), 1);
        assert_eq!(pool.allocate(), 3);
        assert_eq!(pool.allocate(), 5);
    }

    #[test]
    fn host_id_is_never_handed_out() {
        let mut pool = IdPool::new();
        pool.release(HOST_CONNECTION_ID);
        assert_eq!(pool.allocate(), 1);
    }

    #[test]
    fn releasing_an_unallocated_id_is_ignored() {
        let mut pool = IdPool::new();
        pool.release(42);
        assert_eq!(pool.allocate(), 1);
    }
}

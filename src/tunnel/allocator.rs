//! Channel identifier allocation.

use std::collections::BTreeSet;

/// Hands out channel ids for one session.
///
/// Freed ids are reused lowest-first before the counter advances. Id 0 is the
/// control channel and is never handed out.
#[derive(Debug)]
pub struct ChannelAllocator {
    free: BTreeSet<u32>,
    next: u32,
}

impl Default for ChannelAllocator {
    fn default() -> Self {
        Self {
            free: BTreeSet::new(),
            next: 1,
        }
    }
}

impl ChannelAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` once the id space is exhausted.
    pub fn allocate(&mut self) -> Option<u32> {
        if let Some(id) = self.free.pop_first() {
            return Some(id);
        }
        let id = self.next;
        self.next = self.next.checked_add(1)?;
        Some(id)
    }

    /// Return `id` to the pool. Releasing an id that is not allocated is a no-op
    /// and returns `false`.
    pub fn release(&mut self, id: u32) -> bool {
        if id == 0 || id >= self.next {
            return false;
        }
        self.free.insert(id)
    }

    pub fn reset(&mut self) {
        self.free.clear();
        self.next = 1;
    }

    /// Ids currently waiting in the free pool.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

//! Inode index allocation.
//!
//! A monotonic counter with a freelist: freed indices are handed out again
//! before the high-water mark grows. Zero is never issued. The allocator is
//! in-memory only; on start it is rebuilt from the keys of the `inodes`
//! domain.

use std::collections::BTreeSet;

#[derive(Debug, Default)]
pub struct IndexAllocator {
    /// Next never-used index. Everything below is either live or freed.
    next: u64,
    freed: BTreeSet<u64>,
}

impl IndexAllocator {
    pub fn new() -> Self {
        Self {
            next: 1,
            freed: BTreeSet::new(),
        }
    }

    /// Rebuild from the set of live indices.
    pub fn from_used(used: impl IntoIterator<Item = u64>) -> Self {
        let used: BTreeSet<u64> = used.into_iter().filter(|&ino| ino != 0).collect();
        let next = used.iter().next_back().map_or(1, |&max| max + 1);
        let freed = (1..next).filter(|ino| !used.contains(ino)).collect();
        Self { next, freed }
    }

    pub fn allocate(&mut self) -> u64 {
        if let Some(&ino) = self.freed.iter().next() {
            let _ = self.freed.remove(&ino);
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        ino
    }

    pub fn deallocate(&mut self, ino: u64) {
        if ino != 0 && ino < self.next {
            let _ = self.freed.insert(ino);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_issues_zero_and_reclaims() {
        let mut alloc = IndexAllocator::new();
        assert_eq!(alloc.allocate(), 1);
        assert_eq!(alloc.allocate(), 2);
        assert_eq!(alloc.allocate(), 3);
        alloc.deallocate(2);
        assert_eq!(alloc.allocate(), 2);
        assert_eq!(alloc.allocate(), 4);
    }

    #[test]
    fn rebuild_fills_gaps_first() {
        let mut alloc = IndexAllocator::from_used([1, 3, 7]);
        assert_eq!(alloc.allocate(), 2);
        assert_eq!(alloc.allocate(), 4);
        assert_eq!(alloc.allocate(), 5);
        assert_eq!(alloc.allocate(), 6);
        assert_eq!(alloc.allocate(), 8);
    }

    #[test]
    fn rebuild_from_empty_starts_at_one() {
        let mut alloc = IndexAllocator::from_used([]);
        assert_eq!(alloc.allocate(), 1);
        alloc.deallocate(0);
        assert_eq!(alloc.allocate(), 2);
    }
}

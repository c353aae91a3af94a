//! Preallocated arena of index entries
//!
//! Entries are addressed by `u32` index and chained through `next`, so the
//! index never allocates per key. Free entries are tracked by bitmaps of at
//! most [`CHUNK_BITS`] bits each; the entry index doubles as the bitmap slot.

use crate::error::{Error, Result};
use crate::storage::slab::{Bitmap, SlotDescriptor};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// End of a chain
pub const NIL: u32 = u32::MAX;

/// Bits per free-list bitmap
pub const CHUNK_BITS: usize = 1 << 16;

/// One key-to-location mapping
///
/// Fields are atomics so the arena can be shared; chain structure is only
/// changed under the owning bucket group's lock.
#[derive(Debug)]
pub struct Entry {
    key: [AtomicU64; 2],
    location: AtomicU64,
    next: AtomicU32,
}

impl Entry {
    fn new() -> Self {
        Self {
            key: [AtomicU64::new(0), AtomicU64::new(0)],
            location: AtomicU64::new(0),
            next: AtomicU32::new(NIL),
        }
    }

    pub fn key_words(&self) -> [u64; 2] {
        [
            self.key[0].load(Ordering::Acquire),
            self.key[1].load(Ordering::Acquire),
        ]
    }

    pub fn set_key_words(&self, words: [u64; 2]) {
        self.key[0].store(words[0], Ordering::Release);
        self.key[1].store(words[1], Ordering::Release);
    }

    pub fn location(&self) -> SlotDescriptor {
        SlotDescriptor::unpack(self.location.load(Ordering::Acquire))
    }

    pub fn set_location(&self, location: SlotDescriptor) {
        self.location.store(location.pack(), Ordering::Release);
    }

    pub fn next(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }

    pub fn set_next(&self, next: u32) {
        self.next.store(next, Ordering::Release);
    }
}

/// Fixed-capacity entry pool
#[derive(Debug)]
pub struct Arena {
    entries: Box<[Entry]>,
    free: Box<[Bitmap]>,
    /// Chunk to try first; rotated to spread concurrent acquirers
    hint: AtomicUsize,
}

impl Arena {
    pub fn new(capacity: usize) -> Self {
        let chunks = capacity.div_ceil(CHUNK_BITS);
        Self {
            entries: (0..capacity).map(|_| Entry::new()).collect(),
            free: (0..chunks)
                .map(|c| Bitmap::new((capacity - c * CHUNK_BITS).min(CHUNK_BITS)))
                .collect(),
            hint: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: u32) -> Option<&Entry> {
        self.entries.get(index as usize)
    }

    /// Claim a free entry
    pub fn acquire(&self) -> Result<u32> {
        let chunks = self.free.len();
        let start = self.hint.fetch_add(1, Ordering::Relaxed);
        for step in 0..chunks {
            let chunk = (start + step) % chunks;
            let bitmap = &self.free[chunk];
            if bitmap.is_full() {
                continue;
            }
            match bitmap.acquire() {
                Ok(slot) => {
                    let index = chunk * CHUNK_BITS + slot;
                    self.entries[index].set_next(NIL);
                    return Ok(index as u32);
                }
                Err(Error::AllocationExhausted(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::AllocationExhausted(format!(
            "index arena of {} entries is full",
            self.capacity()
        )))
    }

    /// Return an entry to the free list
    pub fn release(&self, index: u32) -> Result<()> {
        let index = index as usize;
        if index >= self.capacity() {
            return Err(Error::InvariantViolation(format!(
                "arena index {} out of range ({} entries)",
                index,
                self.capacity()
            )));
        }
        self.free[index / CHUNK_BITS].release(index % CHUNK_BITS)
    }

    /// Entries currently free
    pub fn free_count(&self) -> usize {
        self.free.iter().map(Bitmap::free_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_acquire_spans_chunks() -> Result<()> {
        let arena = Arena::new(CHUNK_BITS + 10);
        assert_eq!(arena.free.len(), 2);
        assert_eq!(arena.free[1].capacity(), 10);

        let mut seen = HashSet::new();
        for _ in 0..arena.capacity() {
            let index = arena.acquire()?;
            assert!((index as usize) < arena.capacity());
            assert!(seen.insert(index));
        }
        assert!(matches!(arena.acquire(), Err(Error::AllocationExhausted(_))));
        assert_eq!(arena.free_count(), 0);
        Ok(())
    }

    #[test]
    fn test_release_and_reuse() -> Result<()> {
        let arena = Arena::new(4);
        let index = arena.acquire()?;
        let entry = arena.get(index).expect("acquired index is in range");
        entry.set_location(SlotDescriptor::new(1, 2, 3, 4));
        entry.set_next(7);

        arena.release(index)?;
        assert_eq!(arena.free_count(), 4);
        assert!(matches!(arena.release(index), Err(Error::InvariantViolation(_))));
        assert!(matches!(arena.release(99), Err(Error::InvariantViolation(_))));

        let again = arena.acquire()?;
        assert_eq!(arena.get(again).map(Entry::next), Some(NIL));
        Ok(())
    }
}

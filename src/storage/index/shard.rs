//! One shard of the key index
//!
//! ```text
//! groups:  [ lock{b0 b1 b2 b3} ][ lock{b4 b5 b6 b7} ] ...
//!                 |
//!                 +-> head -> arena[12] -> arena[3] -> NIL
//! ```
//!
//! Buckets are chained through arena indices. Four neighbouring buckets
//! share one spin lock to keep lock memory small.

use super::arena::{Arena, Entry, NIL};
use super::spin::SpinRwLock;
use super::Key;
use crate::error::{Error, Result};
use crate::storage::slab::SlotDescriptor;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Buckets sharing one lock
pub const BUCKETS_PER_GROUP: usize = 4;

/// Handle to a live entry
///
/// Stays valid for the life of the shard; the caller's per-key lock keeps
/// the entry from being removed and reused underneath it.
#[derive(Debug, Clone, Copy)]
pub struct EntryRef<'a> {
    index: u32,
    entry: &'a Entry,
}

impl EntryRef<'_> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn location(&self) -> SlotDescriptor {
        self.entry.location()
    }

    pub fn set_location(&self, location: SlotDescriptor) {
        self.entry.set_location(location)
    }
}

/// What [`IndexShard::remove`] unlinked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedEntry {
    /// Arena slot to hand back with [`IndexShard::release_entry`]
    pub arena_index: u32,
    /// Where the value lived
    pub location: SlotDescriptor,
}

/// Hash table from [`Key`] to [`SlotDescriptor`]
pub struct IndexShard {
    arena: Arena,
    groups: Box<[SpinRwLock<[u32; BUCKETS_PER_GROUP]>]>,
    bucket_count: usize,
    len: AtomicUsize,
}

impl IndexShard {
    /// Create a shard with at least `buckets` buckets (rounded up to a prime)
    /// and room for `capacity` keys
    pub fn new(buckets: usize, capacity: usize) -> Self {
        let bucket_count = next_prime(buckets.max(2));
        let group_count = bucket_count.div_ceil(BUCKETS_PER_GROUP);
        Self {
            arena: Arena::new(capacity),
            groups: (0..group_count)
                .map(|_| SpinRwLock::new([NIL; BUCKETS_PER_GROUP]))
                .collect(),
            bucket_count,
            len: AtomicUsize::new(0),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Live keys
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn locate(&self, key: &Key) -> (usize, usize) {
        // Shards are picked from the unshifted hash
        let bucket = (key.hash64() >> 16) as usize % self.bucket_count;
        (bucket / BUCKETS_PER_GROUP, bucket % BUCKETS_PER_GROUP)
    }

    fn entry(&self, index: u32) -> Result<&Entry> {
        self.arena.get(index).ok_or_else(|| {
            Error::InvariantViolation(format!("chain points at arena index {}", index))
        })
    }

    /// Look up `key`
    pub fn find(&self, key: &Key) -> Option<EntryRef<'_>> {
        let (group, slot) = self.locate(key);
        let words = key.words();
        let heads = self.groups[group].read();

        let mut cursor = heads[slot];
        while cursor != NIL {
            let entry = self.arena.get(cursor)?;
            if entry.key_words() == words {
                return Some(EntryRef {
                    index: cursor,
                    entry,
                });
            }
            cursor = entry.next();
        }
        None
    }

    /// Add a new mapping; the key must not already be present
    pub fn insert(&self, key: &Key, location: SlotDescriptor) -> Result<u32> {
        let (group, slot) = self.locate(key);
        let words = key.words();
        let mut heads = self.groups[group].write();

        let mut cursor = heads[slot];
        while cursor != NIL {
            let entry = self.entry(cursor)?;
            if entry.key_words() == words {
                return Err(Error::InvariantViolation(format!(
                    "key {} inserted twice",
                    key
                )));
            }
            cursor = entry.next();
        }

        let index = self.arena.acquire()?;
        let entry = self.entry(index)?;
        entry.set_key_words(words);
        entry.set_location(location);
        entry.set_next(heads[slot]);
        heads[slot] = index;
        self.len.fetch_add(1, Ordering::AcqRel);
        Ok(index)
    }

    /// Unlink `key` from its chain
    ///
    /// The arena slot stays reserved until [`release_entry`](Self::release_entry).
    pub fn remove(&self, key: &Key) -> Result<RemovedEntry> {
        let (group, slot) = self.locate(key);
        let words = key.words();
        let mut heads = self.groups[group].write();

        let mut previous: Option<&Entry> = None;
        let mut cursor = heads[slot];
        while cursor != NIL {
            let entry = self.entry(cursor)?;
            if entry.key_words() == words {
                match previous {
                    Some(prev) => prev.set_next(entry.next()),
                    None => heads[slot] = entry.next(),
                }
                self.len.fetch_sub(1, Ordering::AcqRel);
                return Ok(RemovedEntry {
                    arena_index: cursor,
                    location: entry.location(),
                });
            }
            previous = Some(entry);
            cursor = entry.next();
        }
        Err(Error::NotFound(format!("key {}", key)))
    }

    /// Hand an unlinked entry back to the arena
    pub fn release_entry(&self, arena_index: u32) -> Result<()> {
        self.arena.release(arena_index)
    }
}

/// Smallest prime >= n
pub fn next_prime(n: usize) -> usize {
    fn is_prime(n: usize) -> bool {
        if n < 2 {
            return false;
        }
        let mut d = 2;
        while d * d <= n {
            if n % d == 0 {
                return false;
            }
            d += 1;
        }
        true
    }

    (n..).find(|&c| is_prime(c)).unwrap_or(n)
}

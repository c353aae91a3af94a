//! Concurrent fixed-capacity free-slot bitmap
//!
//! Taking a slot is split in two: a thread first reserves permission by
//! decrementing `free`, then searches the words for a zero bit and claims it
//! with a CAS. Many threads can search at once without a lock. Scan cost is
//! linear in `capacity / 64`; keep a single bitmap below roughly 10^5 bits and
//! shard larger domains across several bitmaps.

use crate::error::{Error, Result};
use std::hint::spin_loop;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const WORD_BITS: usize = 64;

/// Free-slot bitmap. A set bit means the slot is taken.
#[derive(Debug)]
pub struct Bitmap {
    capacity: usize,
    free: AtomicUsize,
    words: Box<[AtomicU64]>,
}

impl Bitmap {
    /// Create a bitmap with every slot in `0..capacity` free
    pub fn new(capacity: usize) -> Self {
        let word_count = capacity.div_ceil(WORD_BITS);
        let words = (0..word_count)
            .map(|i| {
                // Bits past `capacity` in the last word are permanently taken
                let first = i * WORD_BITS;
                let valid = capacity.saturating_sub(first).min(WORD_BITS);
                let tail = if valid == WORD_BITS { 0 } else { !0u64 << valid };
                AtomicU64::new(tail)
            })
            .collect();

        Self {
            capacity,
            free: AtomicUsize::new(capacity),
            words,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of free slots
    pub fn free_count(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.free_count() == 0
    }

    /// Take a free slot and return its id
    pub fn acquire(&self) -> Result<usize> {
        self.free
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| free.checked_sub(1))
            .map_err(|_| {
                Error::AllocationExhausted(format!("bitmap of {} slots is full", self.capacity))
            })?;

        // The reservation guarantees a zero bit exists, but a release may land
        // behind the cursor while we scan, so keep sweeping until we claim one.
        loop {
            for (i, word) in self.words.iter().enumerate() {
                let mut current = word.load(Ordering::Acquire);
                while current != u64::MAX {
                    let bit = (!current).trailing_zeros() as usize;
                    match word.compare_exchange_weak(
                        current,
                        current | (1 << bit),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Ok(i * WORD_BITS + bit),
                        Err(actual) => current = actual,
                    }
                }
            }
            spin_loop();
        }
    }

    /// Return slot `id` to the free set
    pub fn release(&self, id: usize) -> Result<()> {
        if id >= self.capacity {
            return Err(Error::InvariantViolation(format!(
                "slot {} is outside bitmap of {} slots",
                id, self.capacity
            )));
        }
        let mask = 1u64 << (id % WORD_BITS);
        let previous = self.words[id / WORD_BITS].fetch_and(!mask, Ordering::AcqRel);
        if previous & mask == 0 {
            return Err(Error::InvariantViolation(format!(
                "released slot {} was not taken",
                id
            )));
        }
        self.free.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Whether slot `id` is currently taken
    pub fn is_taken(&self, id: usize) -> bool {
        id < self.capacity
            && self.words[id / WORD_BITS].load(Ordering::Acquire) & (1u64 << (id % WORD_BITS)) != 0
    }
}

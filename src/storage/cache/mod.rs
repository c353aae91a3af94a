//! Write-back cache fronting remote memory
//!
//! # Architecture
//!
//! ```text
//! Engine ──insert/find(line, offset)──→ WriteBackCache (one per shard)
//!                                          ├─→ addr → frame map
//!                                          └─→ frames[0..N]  one cacheline each
//!                                                 │ miss: write back dirty victim,
//!                                                 │       read new line
//!                                                 ▼
//!                                          RemoteTransport
//! ```
//!
//! Frames are allocated once and rebound forever after. Each frame has its
//! own mutex so payload copies happen outside the cache-wide lock once the
//! frame is pinned; the cache lock is held across remote I/O only while a
//! miss is serviced.

pub mod clock;
pub mod lru;

pub use self::clock::ClockCache;
pub use self::lru::LruCache;

use crate::config::CachePolicy;
use crate::error::{Error, Result};
use crate::transport::{AccessToken, RemoteTransport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One remote cacheline: the unit the cache holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteLine {
    pub addr: u64,
    pub token: AccessToken,
}

/// Fixed-capacity cache over remote cachelines
pub trait WriteBackCache: Send + Sync {
    /// Copy `bytes` into `line` at `offset`, loading the line on a miss
    fn insert(&self, line: RemoteLine, offset: usize, bytes: &[u8]) -> Result<()>;

    /// Fill `out` from `line` at `offset`, loading the line on a miss
    fn find(&self, line: RemoteLine, offset: usize, out: &mut [u8]) -> Result<()>;

    /// Write every dirty frame back to remote memory; returns frames written
    fn flush(&self) -> Result<usize>;

    /// Get cache statistics
    fn stats(&self) -> CacheStats;

    /// Number of frames
    fn capacity(&self) -> usize;
}

/// Build the cache for `policy`
pub fn build(
    policy: CachePolicy,
    transport: Arc<dyn RemoteTransport>,
    frames: usize,
    line_size: usize,
) -> Box<dyn WriteBackCache> {
    match policy {
        CachePolicy::Lru => Box::new(LruCache::new(transport, frames, line_size)),
        CachePolicy::Clock => Box::new(ClockCache::new(transport, frames, line_size)),
    }
}

/// Local copy of one remote cacheline
#[derive(Debug)]
pub(crate) struct Frame {
    line: Option<RemoteLine>,
    data: Box<[u8]>,
    dirty: bool,
}

impl Frame {
    pub(crate) fn new(line_size: usize) -> Self {
        Self {
            line: None,
            data: vec![0u8; line_size].into_boxed_slice(),
            dirty: false,
        }
    }

    pub(crate) fn line(&self) -> Option<RemoteLine> {
        self.line
    }

    /// Push the buffer to remote memory if dirty
    pub(crate) fn write_back(&mut self, transport: &dyn RemoteTransport) -> Result<bool> {
        match self.line {
            Some(line) if self.dirty => {
                transport.remote_write(&self.data, line.addr, line.token)?;
                self.dirty = false;
                debug!(addr = format_args!("{:#x}", line.addr), "Wrote back dirty cacheline");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Bind to `line` and fill from remote memory; the frame must be clean
    ///
    /// On a failed read the frame is left unbound.
    pub(crate) fn load(&mut self, line: RemoteLine, transport: &dyn RemoteTransport) -> Result<()> {
        self.line = None;
        self.dirty = false;
        transport.remote_read(&mut self.data, line.addr, line.token)?;
        self.line = Some(line);
        Ok(())
    }

    pub(crate) fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let range = self.range(offset, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        self.dirty = true;
        Ok(())
    }

    pub(crate) fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let range = self.range(offset, out.len())?;
        out.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn range(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(offset..end),
            _ => Err(Error::InvalidArgument(format!(
                "range {}+{} exceeds {}-byte cacheline",
                offset,
                len,
                self.data.len()
            ))),
        }
    }
}

/// Reject accesses that cannot fit in one frame before touching any state
pub(crate) fn check_span(offset: usize, len: usize, line_size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= line_size => Ok(()),
        _ => Err(Error::InvalidArgument(format!(
            "range {}+{} exceeds {}-byte cacheline",
            offset, len, line_size
        ))),
    }
}

/// Write back every dirty frame
pub(crate) fn flush_frames<'a>(
    frames: impl Iterator<Item = &'a Mutex<Frame>>,
    transport: &dyn RemoteTransport,
    counters: &Counters,
) -> Result<usize> {
    let mut written = 0;
    for frame in frames {
        if frame.lock().write_back(transport)? {
            written += 1;
        }
    }
    counters.write_backs.fetch_add(written as u64, Ordering::Relaxed);
    Ok(written)
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub write_backs: AtomicU64,
}

impl Counters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, resident: usize, capacity: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
            resident,
            capacity,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Bound frames rebound to another line
    pub evictions: u64,
    /// Dirty frames written to remote memory
    pub write_backs: u64,
    /// Frames currently bound to a line
    pub resident: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Add another cache's counters into this one
    pub fn merge(&mut self, other: &CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.evictions += other.evictions;
        self.write_backs += other.write_backs;
        self.resident += other.resident;
        self.capacity += other.capacity;
    }
}

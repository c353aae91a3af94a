//! LRU write-back cache
//!
//! Recency order comes from the `lru` crate's list; frames live outside it so
//! the list only ever holds `addr -> frame index`. Every lookup reorders the
//! list, so hits and misses alike take the one cache mutex.

use super::{check_span, flush_frames, CacheStats, Counters, Frame, RemoteLine, WriteBackCache};
use crate::error::{Error, Result};
use crate::transport::RemoteTransport;
use ::lru::LruCache as RecencyList;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

struct State {
    recency: RecencyList<u64, usize>,
    /// Frames never bound, or unbound after a failed fill
    free: Vec<usize>,
}

/// Write-back cache evicting the least recently used line
pub struct LruCache {
    transport: Arc<dyn RemoteTransport>,
    line_size: usize,
    frames: Box<[Mutex<Frame>]>,
    state: Mutex<State>,
    counters: Counters,
}

impl LruCache {
    /// Create a cache of `frames` cachelines of `line_size` bytes
    pub fn new(transport: Arc<dyn RemoteTransport>, frames: usize, line_size: usize) -> Self {
        let frames = frames.max(1);
        Self {
            transport,
            line_size,
            frames: (0..frames).map(|_| Mutex::new(Frame::new(line_size))).collect(),
            state: Mutex::new(State {
                recency: RecencyList::unbounded(),
                free: (0..frames).rev().collect(),
            }),
            counters: Counters::default(),
        }
    }

    /// Lock the frame holding `line`, loading it on a miss
    fn pin(&self, line: RemoteLine) -> Result<MutexGuard<'_, Frame>> {
        let mut state = self.state.lock();
        if let Some(&index) = state.recency.get(&line.addr) {
            self.counters.hit();
            return Ok(self.frames[index].lock());
        }
        self.counters.miss();

        let (index, mut frame) = match state.free.pop() {
            Some(index) => (index, self.frames[index].lock()),
            None => {
                let (victim, index) = state.recency.pop_lru().ok_or_else(|| {
                    Error::AllocationExhausted("cache has no frames".to_string())
                })?;
                let mut frame = self.frames[index].lock();
                match frame.write_back(self.transport.as_ref()) {
                    Ok(wrote) => {
                        if wrote {
                            self.counters.write_backs.fetch_add(1, Ordering::Relaxed);
                        }
                        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            victim = format_args!("{:#x}", victim),
                            addr = format_args!("{:#x}", line.addr),
                            "Evicting cacheline"
                        );
                    }
                    Err(e) => {
                        // Victim keeps its data and stays resident
                        state.recency.put(victim, index);
                        return Err(e);
                    }
                }
                (index, frame)
            }
        };

        if let Err(e) = frame.load(line, self.transport.as_ref()) {
            state.free.push(index);
            return Err(e);
        }
        state.recency.put(line.addr, index);
        Ok(frame)
    }
}

impl WriteBackCache for LruCache {
    fn insert(&self, line: RemoteLine, offset: usize, bytes: &[u8]) -> Result<()> {
        check_span(offset, bytes.len(), self.line_size)?;
        self.pin(line)?.write_at(offset, bytes)
    }

    fn find(&self, line: RemoteLine, offset: usize, out: &mut [u8]) -> Result<()> {
        check_span(offset, out.len(), self.line_size)?;
        self.pin(line)?.read_at(offset, out)
    }

    fn flush(&self) -> Result<usize> {
        flush_frames(self.frames.iter(), self.transport.as_ref(), &self.counters)
    }

    fn stats(&self) -> CacheStats {
        let resident = self.state.lock().recency.len();
        self.counters.snapshot(resident, self.frames.len())
    }

    fn capacity(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::transport::MemoryTransport;

    fn cache(transport: &MemoryTransport, frames: usize) -> LruCache {
        LruCache::new(Arc::new(transport.clone()), frames, LINE)
    }

    #[test]
    fn test_one_eviction_past_capacity_writes_back() -> Result<()> {
        let (transport, extent) = setup(8)?;
        let cache = cache(&transport, 4);

        for n in 0..5 {
            cache.insert(line(&extent, n), 0, &[n as u8 + 1; 8])?;
        }
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.write_backs, 1);
        assert_eq!(stats.resident, 4);

        // Line 0 was least recent and was flushed before its frame moved on
        assert_eq!(transport.peek(extent.addr, extent.token, 8)?, vec![1; 8]);
        Ok(())
    }

    #[test]
    fn test_recently_used_line_survives() -> Result<()> {
        let (transport, extent) = setup(8)?;
        let cache = cache(&transport, 2);
        let mut out = [0u8; 4];

        cache.insert(line(&extent, 0), 0, b"aaaa")?;
        cache.insert(line(&extent, 1), 0, b"bbbb")?;
        cache.find(line(&extent, 0), 0, &mut out)?;
        cache.insert(line(&extent, 2), 0, b"cccc")?;

        let misses = cache.stats().misses;
        cache.find(line(&extent, 0), 0, &mut out)?;
        assert_eq!(&out, b"aaaa");
        assert_eq!(cache.stats().misses, misses);

        // Line 1 was evicted; reading it back comes from remote memory
        cache.find(line(&extent, 1), 0, &mut out)?;
        assert_eq!(&out, b"bbbb");
        assert_eq!(cache.stats().misses, misses + 1);
        Ok(())
    }

    #[test]
    fn test_failed_fill_frees_frame() -> Result<()> {
        let (transport, extent) = setup(8)?;
        let cache = cache(&transport, 2);
        cache.insert(line(&extent, 0), 0, b"x")?;
        cache.insert(line(&extent, 1), 0, b"y")?;

        transport.fail_reads(true);
        assert!(matches!(
            cache.insert(line(&extent, 2), 0, b"z"),
            Err(Error::RemoteIo(_))
        ));
        transport.fail_reads(false);

        // The victim was written back, then its frame went unbound
        assert_eq!(cache.stats().resident, 1);
        assert_eq!(transport.peek(extent.addr, extent.token, 1)?, b"x".to_vec());
        cache.insert(line(&extent, 2), 0, b"z")?;
        assert_eq!(cache.stats().resident, 2);
        Ok(())
    }

    #[test]
    fn test_failed_write_back_keeps_victim() -> Result<()> {
        let (transport, extent) = setup(8)?;
        let cache = cache(&transport, 1);
        cache.insert(line(&extent, 0), 0, b"keep")?;

        transport.fail_writes(true);
        assert!(cache.insert(line(&extent, 1), 0, b"new!").is_err());
        transport.fail_writes(false);

        let mut out = [0u8; 4];
        cache.find(line(&extent, 0), 0, &mut out)?;
        assert_eq!(&out, b"keep");
        Ok(())
    }
}

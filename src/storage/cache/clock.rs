//! Clock write-back cache
//!
//! Frames sit on a fixed ring. A hit only sets the frame's visited flag, so
//! hits share the read lock. On a miss the hand sweeps forward clearing
//! visited flags and takes the first unvisited frame; if it wraps all the way
//! round it takes the frame it started at.

use super::{check_span, flush_frames, CacheStats, Counters, Frame, RemoteLine, WriteBackCache};
use crate::error::Result;
use crate::transport::RemoteTransport;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

struct Slot {
    visited: AtomicBool,
    frame: Mutex<Frame>,
}

struct State {
    resident: HashMap<u64, usize>,
    hand: usize,
}

/// Write-back cache with clock (second chance) eviction
pub struct ClockCache {
    transport: Arc<dyn RemoteTransport>,
    line_size: usize,
    ring: Box<[Slot]>,
    state: RwLock<State>,
    counters: Counters,
}

impl ClockCache {
    /// Create a cache of `frames` cachelines of `line_size` bytes
    pub fn new(transport: Arc<dyn RemoteTransport>, frames: usize, line_size: usize) -> Self {
        let frames = frames.max(1);
        Self {
            transport,
            line_size,
            ring: (0..frames)
                .map(|_| Slot {
                    visited: AtomicBool::new(false),
                    frame: Mutex::new(Frame::new(line_size)),
                })
                .collect(),
            state: RwLock::new(State {
                resident: HashMap::with_capacity(frames),
                hand: 0,
            }),
            counters: Counters::default(),
        }
    }

    fn hit(&self, index: usize) -> MutexGuard<'_, Frame> {
        self.counters.hit();
        self.ring[index].visited.store(true, Ordering::Release);
        self.ring[index].frame.lock()
    }

    /// Pick the next victim and move the hand past it
    fn advance_hand(&self, state: &mut State) -> usize {
        let len = self.ring.len();
        let start = state.hand;
        let victim = (0..len)
            .map(|step| (start + step) % len)
            .find(|&pos| !self.ring[pos].visited.swap(false, Ordering::AcqRel))
            .unwrap_or(start);
        state.hand = (victim + 1) % len;
        victim
    }

    /// Lock the frame holding `line`, loading it on a miss
    fn pin(&self, line: RemoteLine) -> Result<MutexGuard<'_, Frame>> {
        {
            let state = self.state.read();
            if let Some(&index) = state.resident.get(&line.addr) {
                return Ok(self.hit(index));
            }
        }

        let mut state = self.state.write();
        // Another thread may have loaded the line between the two locks
        if let Some(&index) = state.resident.get(&line.addr) {
            return Ok(self.hit(index));
        }
        self.counters.miss();

        let index = self.advance_hand(&mut state);
        let mut frame = self.ring[index].frame.lock();
        if let Some(old) = frame.line() {
            if frame.write_back(self.transport.as_ref())? {
                self.counters.write_backs.fetch_add(1, Ordering::Relaxed);
            }
            state.resident.remove(&old.addr);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(
                victim = format_args!("{:#x}", old.addr),
                addr = format_args!("{:#x}", line.addr),
                "Evicting cacheline"
            );
        }

        frame.load(line, self.transport.as_ref())?;
        state.resident.insert(line.addr, index);
        self.ring[index].visited.store(true, Ordering::Release);
        Ok(frame)
    }
}

impl WriteBackCache for ClockCache {
    fn insert(&self, line: RemoteLine, offset: usize, bytes: &[u8]) -> Result<()> {
        check_span(offset, bytes.len(), self.line_size)?;
        self.pin(line)?.write_at(offset, bytes)
    }

    fn find(&self, line: RemoteLine, offset: usize, out: &mut [u8]) -> Result<()> {
        check_span(offset, out.len(), self.line_size)?;
        self.pin(line)?.read_at(offset, out)
    }

    fn flush(&self) -> Result<usize> {
        flush_frames(
            self.ring.iter().map(|slot| &slot.frame),
            self.transport.as_ref(),
            &self.counters,
        )
    }

    fn stats(&self) -> CacheStats {
        let resident = self.state.read().resident.len();
        self.counters.snapshot(resident, self.ring.len())
    }

    fn capacity(&self) -> usize {
        self.ring.len()
    }
}

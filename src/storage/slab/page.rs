//! Page: one remote extent carved into fixed-size slots
//!
//! ```text
//! extent  [ cacheline 0 | cacheline 1 | ... | cacheline N-1 ]
//!            |
//!            +-> [slot 0][slot 1]...[slot M-1]   M = cacheline_size / size_class
//!                 one Bitmap per cacheline
//! ```
//!
//! A page belongs to one size class at a time and may only be reformatted
//! for another class once every slot has been released.

use super::bitmap::Bitmap;
use super::slot::{CachelineId, PageId, PageInfo, SlotIndex};
use crate::error::{Error, Result};
use crate::transport::RemoteExtent;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Where a page currently sits in its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Serving allocations as the active page of its class
    Active,
    /// Queued for reuse by its class
    NotFull,
    /// Drained and queued for any class
    Empty,
    /// Retired from active duty and not queued anywhere
    Detached,
}

/// A slot handed out by [`Page::acquire_slot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredSlot {
    pub cacheline_id: CachelineId,
    pub slot_id: SlotIndex,
    /// Class the page was formatted for when the slot was taken
    pub size_class: usize,
}

#[derive(Debug)]
struct Layout {
    size_class: usize,
    state: PageState,
    bitmaps: Vec<Bitmap>,
}

/// Slab unit backed by one remote extent
#[derive(Debug)]
pub struct Page {
    id: PageId,
    extent: RemoteExtent,
    cacheline_size: usize,
    cachelines: usize,
    in_use: AtomicUsize,
    layout: RwLock<Layout>,
}

impl Page {
    /// Create an active page formatted for `size_class`
    pub fn new(id: PageId, extent: RemoteExtent, cacheline_size: usize, size_class: usize) -> Self {
        let cachelines = extent.len / cacheline_size;
        Self {
            id,
            extent,
            cacheline_size,
            cachelines,
            in_use: AtomicUsize::new(0),
            layout: RwLock::new(Layout {
                size_class,
                state: PageState::Active,
                bitmaps: Self::format(cachelines, cacheline_size, size_class),
            }),
        }
    }

    fn format(cachelines: usize, cacheline_size: usize, size_class: usize) -> Vec<Bitmap> {
        (0..cachelines)
            .map(|_| Bitmap::new(cacheline_size / size_class))
            .collect()
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn start_addr(&self) -> u64 {
        self.extent.addr
    }

    pub fn size_class(&self) -> usize {
        self.layout.read().size_class
    }

    pub fn state(&self) -> PageState {
        self.layout.read().state
    }

    /// Slots currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.in_use() == 0
    }

    /// Total slots at the current size class
    pub fn capacity(&self) -> usize {
        self.capacity_for(self.size_class())
    }

    fn capacity_for(&self, size_class: usize) -> usize {
        self.cachelines * (self.cacheline_size / size_class)
    }

    /// Addressing information for the engine
    pub fn info(&self) -> PageInfo {
        PageInfo {
            start_addr: self.extent.addr,
            token: self.extent.token,
            size_class: self.size_class(),
        }
    }

    /// Take a free slot
    ///
    /// Only active pages hand out slots; any other state reports exhaustion
    /// so the caller moves on to the current active page.
    pub fn acquire_slot(&self) -> Result<AcquiredSlot> {
        let layout = self.layout.read();
        if layout.state == PageState::Active {
            for (cacheline_id, bitmap) in layout.bitmaps.iter().enumerate() {
                if bitmap.is_full() {
                    continue;
                }
                match bitmap.acquire() {
                    Ok(slot_id) => {
                        let (Ok(cacheline_id), Ok(slot_id)) =
                            (CachelineId::try_from(cacheline_id), SlotIndex::try_from(slot_id))
                        else {
                            bitmap.release(slot_id)?;
                            return Err(Error::InvariantViolation(format!(
                                "page {} slot {}/{} overflows the slot descriptor",
                                self.id, cacheline_id, slot_id
                            )));
                        };
                        self.in_use.fetch_add(1, Ordering::AcqRel);
                        return Ok(AcquiredSlot {
                            cacheline_id,
                            slot_id,
                            size_class: layout.size_class,
                        });
                    }
                    Err(Error::AllocationExhausted(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Err(Error::AllocationExhausted(format!(
            "page {} has no free {}-byte slot",
            self.id, layout.size_class
        )))
    }

    /// Return a slot to its cacheline bitmap
    ///
    /// Returns `true` exactly when this release brings occupancy down to the
    /// recycle threshold (1/8 of the slots free).
    pub fn release_slot(&self, cacheline_id: CachelineId, slot_id: SlotIndex) -> Result<bool> {
        let layout = self.layout.read();
        let bitmap = layout.bitmaps.get(cacheline_id as usize).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "page {} has no cacheline {}",
                self.id, cacheline_id
            ))
        })?;
        bitmap.release(slot_id as usize)?;

        let previous = self.in_use.fetch_sub(1, Ordering::AcqRel);
        let capacity = self.capacity_for(layout.size_class);
        Ok(!below_threshold(previous, capacity) && below_threshold(previous - 1, capacity))
    }

    /// Discard all bitmaps and rebuild them for `size_class`
    pub fn reformat(&self, size_class: usize) -> Result<()> {
        let mut layout = self.layout.write();
        let in_use = self.in_use();
        if in_use != 0 {
            return Err(Error::InvariantViolation(format!(
                "cannot reformat page {} with {} slots in use",
                self.id, in_use
            )));
        }
        if layout.size_class == size_class {
            return Ok(());
        }

        debug!(page = self.id, from = layout.size_class, to = size_class, "Reformatting page");
        layout.size_class = size_class;
        layout.bitmaps = Self::format(self.cachelines, self.cacheline_size, size_class);
        Ok(())
    }

    /// Move from `from` to `to`; returns false if the page was not in `from`
    pub fn transition(&self, from: PageState, to: PageState) -> bool {
        let mut layout = self.layout.write();
        if layout.state != from {
            return false;
        }
        layout.state = to;
        true
    }

    /// Detach an active page that has no slots in use
    pub fn retire_if_empty(&self) -> bool {
        let mut layout = self.layout.write();
        // Slots are only taken under the read lock, so in_use is stable here
        if layout.state != PageState::Active || self.in_use() != 0 {
            return false;
        }
        layout.state = PageState::Detached;
        true
    }

    /// Decide where a detached page belongs now
    ///
    /// Moves a detached page to `Empty` when drained or `NotFull` when at or
    /// below the recycle threshold, returning the new state. Pages in any
    /// other state, or still too full, are left alone.
    pub fn settle(&self) -> Option<PageState> {
        let mut layout = self.layout.write();
        if layout.state != PageState::Detached {
            return None;
        }
        let in_use = self.in_use();
        let next = if in_use == 0 {
            PageState::Empty
        } else if below_threshold(in_use, self.capacity_for(layout.size_class)) {
            PageState::NotFull
        } else {
            return None;
        };
        layout.state = next;
        Some(next)
    }
}

/// At most 7/8 of the slots taken
fn below_threshold(in_use: usize, capacity: usize) -> bool {
    in_use * 8 <= capacity * 7
}

#[cfg(test)]
mod tests {
    use super::*;

    const CACHELINE: usize = 256;

    fn page(size_class: usize) -> Page {
        let extent = RemoteExtent {
            addr: 0x4000,
            token: 1,
            len: CACHELINE * 4,
        };
        Page::new(0, extent, CACHELINE, size_class)
    }

    #[test]
    fn test_acquire_until_exhausted() -> Result<()> {
        let page = page(64);
        assert_eq!(page.capacity(), 16);

        let mut slots = Vec::new();
        for _ in 0..16 {
            slots.push(page.acquire_slot()?);
        }
        assert_eq!(page.in_use(), 16);
        assert!(matches!(page.acquire_slot(), Err(Error::AllocationExhausted(_))));

        // Cachelines fill in order, four 64-byte slots each
        assert_eq!(slots[0].cacheline_id, 0);
        assert_eq!(slots[4].cacheline_id, 1);
        assert_eq!(slots[15].slot_id, 3);
        assert!(slots.iter().all(|s| s.size_class == 64));
        Ok(())
    }

    #[test]
    fn test_release_reports_threshold_crossing_once() -> Result<()> {
        let page = page(64);
        let slots: Vec<_> = (0..16).map(|_| page.acquire_slot()).collect::<Result<_>>()?;

        // 16 -> 15 slots in use: 15 * 8 = 120 > 112, still above threshold
        assert!(!page.release_slot(slots[0].cacheline_id, slots[0].slot_id)?);
        // 15 -> 14: 14 * 8 = 112 <= 112, crossed
        assert!(page.release_slot(slots[1].cacheline_id, slots[1].slot_id)?);
        // Already below, no second signal
        assert!(!page.release_slot(slots[2].cacheline_id, slots[2].slot_id)?);
        assert_eq!(page.in_use(), 13);
        Ok(())
    }

    #[test]
    fn test_reformat_requires_empty_page() -> Result<()> {
        let page = page(64);
        let slot = page.acquire_slot()?;
        assert!(matches!(page.reformat(128), Err(Error::InvariantViolation(_))));

        page.release_slot(slot.cacheline_id, slot.slot_id)?;
        page.reformat(128)?;
        assert_eq!(page.size_class(), 128);
        assert_eq!(page.capacity(), 8);
        Ok(())
    }

    #[test]
    fn test_inactive_page_hands_out_nothing() -> Result<()> {
        let page = page(64);
        assert!(page.transition(PageState::Active, PageState::Detached));
        assert!(matches!(page.acquire_slot(), Err(Error::AllocationExhausted(_))));
        assert!(!page.transition(PageState::Active, PageState::Empty));
        Ok(())
    }

    #[test]
    fn test_settle_routes_detached_pages() -> Result<()> {
        let page = page(64);
        let slots: Vec<_> = (0..16).map(|_| page.acquire_slot()).collect::<Result<_>>()?;

        // Active pages are never settled
        assert_eq!(page.settle(), None);
        page.transition(PageState::Active, PageState::Detached);
        // Full page stays detached
        assert_eq!(page.settle(), None);

        for slot in &slots[..2] {
            page.release_slot(slot.cacheline_id, slot.slot_id)?;
        }
        assert_eq!(page.settle(), Some(PageState::NotFull));
        assert_eq!(page.state(), PageState::NotFull);

        page.transition(PageState::NotFull, PageState::Detached);
        for slot in &slots[2..] {
            page.release_slot(slot.cacheline_id, slot.slot_id)?;
        }
        assert_eq!(page.settle(), Some(PageState::Empty));
        Ok(())
    }

    #[test]
    fn test_retire_only_idle_active_pages() -> Result<()> {
        let page = page(64);
        let slot = page.acquire_slot()?;
        assert!(!page.retire_if_empty());

        page.release_slot(slot.cacheline_id, slot.slot_id)?;
        assert!(page.retire_if_empty());
        assert_eq!(page.state(), PageState::Detached);
        assert!(!page.retire_if_empty());
        assert_eq!(page.settle(), Some(PageState::Empty));
        Ok(())
    }

    #[test]
    fn test_slot_ids_past_16_bits_are_refused() -> Result<()> {
        let cacheline = 16 * (u16::MAX as usize + 2);
        let extent = RemoteExtent {
            addr: 0x4000,
            token: 1,
            len: cacheline,
        };
        let page = Page::new(0, extent, cacheline, 16);

        for _ in 0..=u16::MAX as usize {
            page.acquire_slot()?;
        }
        // The next bitmap id would wrap onto slot 0
        assert!(matches!(page.acquire_slot(), Err(Error::InvariantViolation(_))));
        assert_eq!(page.in_use(), u16::MAX as usize + 1);
        Ok(())
    }

    #[test]
    fn test_bad_release_is_invariant_violation() {
        let page = page(64);
        assert!(matches!(page.release_slot(9, 0), Err(Error::InvariantViolation(_))));
        assert!(matches!(page.release_slot(0, 0), Err(Error::InvariantViolation(_))));
        assert_eq!(page.in_use(), 0);
    }
}

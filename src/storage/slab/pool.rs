//! Slab pool: pages per size class over registered remote memory
//!
//! # Architecture
//!
//! ```text
//! SlabPool (one per shard)
//!   ├─→ active[class]     AtomicU32 page id, swapped by CAS
//!   ├─→ not_full[class]   pages of that class with >= 1/8 free slots
//!   ├─→ empty             drained pages, reformatted on reuse
//!   └─→ pages[id]         dense, write-once page table
//! ```
//!
//! Allocation tries the active page of the class. When it is exhausted the
//! active pointer is replaced by, in order: a not-full page of the class, an
//! empty page reformatted for the class, or a freshly registered extent.
//! Registration happens under the pool-wide provisioning lock.

use super::page::{Page, PageState};
use super::size_class::SizeClasses;
use super::slot::{PageId, PageInfo, SlotDescriptor};
use crate::error::{Error, Result};
use crate::transport::RemoteTransport;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Marker for "no active page" in the active-page table
const NO_PAGE: u32 = u32::MAX;

/// Geometry of the pages a pool creates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub extent_size: usize,
    pub cacheline_size: usize,
    pub max_pages: usize,
}

/// Slab allocator over remote memory
pub struct SlabPool {
    transport: Arc<dyn RemoteTransport>,
    geometry: PoolGeometry,
    classes: SizeClasses,
    pages: Box<[OnceLock<Page>]>,
    page_count: AtomicUsize,
    active: Box<[AtomicU32]>,
    not_full: Box<[Mutex<VecDeque<PageId>>]>,
    empty: Mutex<VecDeque<PageId>>,
    provision: Mutex<()>,
}

impl SlabPool {
    /// Create an empty pool; no remote memory is registered until first use
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        geometry: PoolGeometry,
        classes: SizeClasses,
    ) -> Self {
        Self {
            transport,
            geometry,
            classes,
            pages: (0..geometry.max_pages).map(|_| OnceLock::new()).collect(),
            page_count: AtomicUsize::new(0),
            active: (0..classes.count()).map(|_| AtomicU32::new(NO_PAGE)).collect(),
            not_full: (0..classes.count())
                .map(|_| Mutex::new(VecDeque::new()))
                .collect(),
            empty: Mutex::new(VecDeque::new()),
            provision: Mutex::new(()),
        }
    }

    pub fn classes(&self) -> &SizeClasses {
        &self.classes
    }

    pub fn cacheline_size(&self) -> usize {
        self.geometry.cacheline_size
    }

    /// Allocate a slot big enough for `size` bytes
    pub fn allocate(&self, size: usize) -> Result<SlotDescriptor> {
        let class = self.classes.index_for(size)?;
        let slot_size = self.classes.slot_size(class);
        let value_size = u16::try_from(size).map_err(|_| {
            Error::InvalidArgument(format!("{} bytes overflows the 16-bit size field", size))
        })?;

        loop {
            let current = self.active[class].load(Ordering::Acquire);
            if current != NO_PAGE {
                let page = self.page(current as PageId)?;
                match page.acquire_slot() {
                    // A stale read of the active pointer can land on a page
                    // that has since been reformatted for another class.
                    Ok(slot) if slot.size_class != slot_size => {
                        self.release(page, slot.cacheline_id, slot.slot_id)?;
                    }
                    Ok(slot) => {
                        return Ok(SlotDescriptor::new(
                            page.id(),
                            slot.cacheline_id,
                            slot.slot_id,
                            value_size,
                        ));
                    }
                    Err(Error::AllocationExhausted(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            self.replace_active(class, current)?;
        }
    }

    /// Return a slot to its page
    pub fn free(&self, slot: SlotDescriptor) -> Result<()> {
        let page = self.page(slot.page_id)?;
        self.release(page, slot.cacheline_id, slot.slot_id)
    }

    fn release(&self, page: &Page, cacheline_id: u16, slot_id: u16) -> Result<()> {
        let crossed = page.release_slot(cacheline_id, slot_id)?;
        if crossed || page.is_empty() {
            self.recycle(page);
        }
        Ok(())
    }

    /// Look up where a page lives
    pub fn page_info(&self, page_id: PageId) -> Result<PageInfo> {
        Ok(self.page(page_id)?.info())
    }

    fn page(&self, page_id: PageId) -> Result<&Page> {
        self.pages
            .get(page_id as usize)
            .and_then(OnceLock::get)
            .ok_or_else(|| Error::InvariantViolation(format!("unknown page id {}", page_id)))
    }

    /// Queue a detached page where it now belongs
    fn recycle(&self, page: &Page) {
        match page.settle() {
            Some(PageState::Empty) => {
                debug!(page = page.id(), "Page drained, moving to empty pool");
                self.empty.lock().push_back(page.id());
            }
            Some(PageState::NotFull) => {
                if let Some(class) = self.classes.index_of_slot_size(page.size_class()) {
                    self.not_full[class].lock().push_back(page.id());
                }
            }
            _ => {}
        }
    }

    /// Swap a new page into `active[class]` if it still holds `exhausted`
    fn replace_active(&self, class: usize, exhausted: u32) -> Result<()> {
        if self.active[class].load(Ordering::Acquire) != exhausted {
            return Ok(());
        }

        let candidate = self.next_page(class)?;
        self.install_active(class, exhausted, candidate)?;
        Ok(())
    }

    /// CAS `candidate` over `exhausted`; returns whether it was installed
    ///
    /// The page that is no longer active, the old one or a losing candidate,
    /// is detached and requeued.
    fn install_active(&self, class: usize, exhausted: u32, candidate: &Page) -> Result<bool> {
        match self.active[class].compare_exchange(
            exhausted,
            candidate.id() as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                if exhausted != NO_PAGE {
                    let old = self.page(exhausted as PageId)?;
                    if old.transition(PageState::Active, PageState::Detached) {
                        self.recycle(old);
                    }
                }
                Ok(true)
            }
            Err(_) => {
                // Another thread installed a page first
                if candidate.transition(PageState::Active, PageState::Detached) {
                    self.recycle(candidate);
                }
                Ok(false)
            }
        }
    }

    /// Find or create a page for `class`, already marked active
    fn next_page(&self, class: usize) -> Result<&Page> {
        if let Some(page) = self.pop_not_full(class)? {
            return Ok(page);
        }
        if let Some(page) = self.pop_empty(class)? {
            return Ok(page);
        }

        let _guard = self.provision.lock();
        // Another thread may have drained pages while we waited.
        self.sweep()?;
        if let Some(page) = self.pop_empty(class)? {
            return Ok(page);
        }
        match self.register_page(class) {
            Ok(page) => Ok(page),
            Err(e @ (Error::AllocationExhausted(_) | Error::RemoteIo(_))) => {
                if self.reclaim_idle(class)? > 0 {
                    if let Some(page) = self.pop_empty(class)? {
                        return Ok(page);
                    }
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Retire drained active pages of other classes into the empty pool
    fn reclaim_idle(&self, class: usize) -> Result<usize> {
        let mut reclaimed = 0;
        for (other, active) in self.active.iter().enumerate() {
            let id = active.load(Ordering::Acquire);
            if other == class || id == NO_PAGE {
                continue;
            }
            let page = self.page(id as PageId)?;
            if page.retire_if_empty() {
                // Losing this race means another thread already replaced it
                let _ = active.compare_exchange(id, NO_PAGE, Ordering::AcqRel, Ordering::Acquire);
                self.recycle(page);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            debug!(pages = reclaimed, "Reclaimed idle active pages");
        }
        Ok(reclaimed)
    }

    fn pop_not_full(&self, class: usize) -> Result<Option<&Page>> {
        loop {
            let Some(id) = self.not_full[class].lock().pop_front() else {
                return Ok(None);
            };
            let page = self.page(id)?;
            if page.transition(PageState::NotFull, PageState::Active) {
                return Ok(Some(page));
            }
        }
    }

    fn pop_empty(&self, class: usize) -> Result<Option<&Page>> {
        loop {
            let Some(id) = self.empty.lock().pop_front() else {
                return Ok(None);
            };
            let page = self.page(id)?;
            page.reformat(self.classes.slot_size(class))?;
            if page.transition(PageState::Empty, PageState::Active) {
                return Ok(Some(page));
            }
        }
    }

    /// Move drained pages out of the not-full queues into the empty pool
    pub fn sweep(&self) -> Result<usize> {
        let mut drained = Vec::new();
        for queue in self.not_full.iter() {
            let mut queue = queue.lock();
            let mut kept = VecDeque::with_capacity(queue.len());
            for id in queue.drain(..) {
                let page = self.page(id)?;
                if page.is_empty() && page.transition(PageState::NotFull, PageState::Empty) {
                    drained.push(id);
                } else {
                    kept.push_back(id);
                }
            }
            *queue = kept;
        }

        let count = drained.len();
        if count > 0 {
            debug!(pages = count, "Swept drained pages into empty pool");
            self.empty.lock().extend(drained);
        }
        Ok(count)
    }

    /// Register a new extent and format it for `class`; caller holds `provision`
    fn register_page(&self, class: usize) -> Result<&Page> {
        let id = self.page_count.load(Ordering::Acquire);
        if id >= self.geometry.max_pages {
            return Err(Error::AllocationExhausted(format!(
                "all {} pages in use, none free for {}-byte slots",
                self.geometry.max_pages,
                self.classes.slot_size(class)
            )));
        }

        let extent = self.transport.register_extent(self.geometry.extent_size)?;
        let page = Page::new(
            id as PageId,
            extent,
            self.geometry.cacheline_size,
            self.classes.slot_size(class),
        );
        if self.pages[id].set(page).is_err() {
            return Err(Error::InvariantViolation(format!(
                "page id {} registered twice",
                id
            )));
        }
        self.page_count.store(id + 1, Ordering::Release);

        info!(
            page = id,
            addr = format_args!("{:#x}", extent.addr),
            slot_size = self.classes.slot_size(class),
            "Registered remote extent"
        );
        self.page(id as PageId)
    }

    /// Get statistics about the pool
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for page in self.pages.iter().filter_map(OnceLock::get) {
            stats.pages += 1;
            stats.slots_in_use += page.in_use();
            match page.state() {
                PageState::Active => stats.active_pages += 1,
                PageState::NotFull => stats.not_full_pages += 1,
                PageState::Empty => stats.empty_pages += 1,
                PageState::Detached => stats.detached_pages += 1,
            }
        }
        stats
    }
}

/// Statistics for the slab pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub pages: usize,
    pub active_pages: usize,
    pub not_full_pages: usize,
    pub empty_pages: usize,
    pub detached_pages: usize,
    pub slots_in_use: usize,
}

impl PoolStats {
    /// Add another pool's counts into this one
    pub fn merge(&mut self, other: &PoolStats) {
        self.pages += other.pages;
        self.active_pages += other.active_pages;
        self.not_full_pages += other.not_full_pages;
        self.empty_pages += other.empty_pages;
        self.detached_pages += other.detached_pages;
        self.slots_in_use += other.slots_in_use;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use std::collections::HashSet;

    const CACHELINE: usize = 256;

    fn pool(max_pages: usize) -> Result<SlabPool> {
        let transport = MemoryTransport::new();
        transport.connect("127.0.0.1", 0)?;
        Ok(SlabPool::new(
            Arc::new(transport),
            PoolGeometry {
                extent_size: CACHELINE * 2,
                cacheline_size: CACHELINE,
                max_pages,
            },
            SizeClasses::new(16, 256),
        ))
    }

    #[test]
    fn test_allocate_same_class_shares_page() -> Result<()> {
        let pool = pool(4)?;
        let a = pool.allocate(5)?;
        let b = pool.allocate(10)?;
        assert_eq!(a.page_id, b.page_id);
        assert_ne!((a.cacheline_id, a.slot_id), (b.cacheline_id, b.slot_id));
        assert_eq!(a.value_size, 5);
        assert_eq!(pool.page_info(a.page_id)?.size_class, 16);
        Ok(())
    }

    #[test]
    fn test_classes_get_separate_pages() -> Result<()> {
        let pool = pool(4)?;
        let small = pool.allocate(5)?;
        let large = pool.allocate(200)?;
        assert_ne!(small.page_id, large.page_id);
        assert_eq!(pool.page_info(large.page_id)?.size_class, 208);
        Ok(())
    }

    #[test]
    fn test_exhaustion_and_reuse_after_free() -> Result<()> {
        // One page of two 256-byte cachelines, 128-byte slots: 4 slots total
        let pool = pool(1)?;
        let slots: Vec<_> = (0..4).map(|_| pool.allocate(128)).collect::<Result<_>>()?;
        assert!(matches!(pool.allocate(128), Err(Error::AllocationExhausted(_))));

        pool.free(slots[2])?;
        let again = pool.allocate(120)?;
        assert_eq!((again.cacheline_id, again.slot_id), (slots[2].cacheline_id, slots[2].slot_id));
        Ok(())
    }

    #[test]
    fn test_drained_page_is_reformatted_for_another_class() -> Result<()> {
        let pool = pool(2)?;
        // Fill the first page with 128-byte slots and force a second page
        let first: Vec<_> = (0..4).map(|_| pool.allocate(128)).collect::<Result<_>>()?;
        let spill = pool.allocate(128)?;
        assert_ne!(spill.page_id, first[0].page_id);

        // Drain the retired first page; it waits in its class queue
        for slot in &first {
            pool.free(*slot)?;
        }
        let stats = pool.stats();
        assert_eq!(stats.not_full_pages, 1);
        assert_eq!(stats.slots_in_use, 1);

        // No page budget left, so a sweep hands the drained page to the new class
        let small = pool.allocate(8)?;
        assert_eq!(small.page_id, first[0].page_id);
        assert_eq!(pool.page_info(small.page_id)?.size_class, 16);
        Ok(())
    }

    #[test]
    fn test_not_full_page_returns_to_its_class() -> Result<()> {
        let pool = pool(3)?;
        let first: Vec<_> = (0..4).map(|_| pool.allocate(128)).collect::<Result<_>>()?;
        let second = pool.allocate(128)?;
        let first_page = first[0].page_id;

        // 4 -> 3 slots in use crosses the 7/8 threshold on a retired page
        pool.free(first[0])?;
        assert_eq!(pool.stats().not_full_pages, 1);

        // Exhaust the second page; the not-full page is preferred over a new extent
        for _ in 0..3 {
            pool.allocate(128)?;
        }
        let reused = pool.allocate(128)?;
        assert_eq!(reused.page_id, first_page);
        assert_ne!(reused.page_id, second.page_id);
        assert_eq!(pool.stats().pages, 2);
        Ok(())
    }

    #[test]
    fn test_sweep_moves_drained_not_full_pages() -> Result<()> {
        let pool = pool(3)?;
        let first: Vec<_> = (0..4).map(|_| pool.allocate(128)).collect::<Result<_>>()?;
        pool.allocate(128)?;
        pool.free(first[0])?;
        assert_eq!(pool.stats().not_full_pages, 1);

        for slot in &first[1..] {
            pool.free(*slot)?;
        }
        assert_eq!(pool.sweep()?, 1);
        let stats = pool.stats();
        assert_eq!(stats.not_full_pages, 0);
        assert_eq!(stats.empty_pages, 1);
        Ok(())
    }

    #[test]
    fn test_idle_active_page_is_reclaimed_when_full() -> Result<()> {
        let pool = pool(1)?;
        let small = pool.allocate(10)?;
        assert!(matches!(pool.allocate(200), Err(Error::AllocationExhausted(_))));

        // Once drained, the small class no longer pins the only page
        pool.free(small)?;
        let large = pool.allocate(200)?;
        assert_eq!(large.page_id, small.page_id);
        assert_eq!(pool.page_info(large.page_id)?.size_class, 208);
        assert_eq!(pool.stats().pages, 1);

        // and the small class gets it back the same way
        pool.free(large)?;
        assert_eq!(pool.allocate(10)?.page_id, small.page_id);
        Ok(())
    }

    #[test]
    fn test_losing_candidate_is_requeued() -> Result<()> {
        let pool = pool(4)?;
        let class = pool.classes().index_for(128)?;
        let installed = pool.allocate(128)?;

        // A fresh candidate raced against the page already installed
        let fresh = pool.next_page(class)?;
        assert!(!pool.install_active(class, NO_PAGE, fresh)?);
        assert_eq!(pool.active[class].load(Ordering::Acquire), installed.page_id as u32);
        assert_eq!(fresh.state(), PageState::Empty);
        assert_eq!(pool.empty.lock().front(), Some(&fresh.id()));

        // A partly used candidate goes back to its class queue
        let partial = pool.next_page(class)?;
        assert_eq!(partial.id(), fresh.id());
        let held = partial.acquire_slot()?;
        assert!(!pool.install_active(class, NO_PAGE, partial)?);
        assert_eq!(partial.state(), PageState::NotFull);
        assert_eq!(pool.not_full[class].lock().front(), Some(&partial.id()));

        // The winner keeps serving allocations
        assert_eq!(pool.allocate(128)?.page_id, installed.page_id);
        partial.release_slot(held.cacheline_id, held.slot_id)?;
        Ok(())
    }

    #[test]
    fn test_unknown_page_and_double_free() -> Result<()> {
        let pool = pool(2)?;
        assert!(matches!(pool.page_info(1), Err(Error::InvariantViolation(_))));

        let slot = pool.allocate(32)?;
        pool.free(slot)?;
        assert!(matches!(pool.free(slot), Err(Error::InvariantViolation(_))));
        Ok(())
    }

    #[test]
    fn test_registration_failure_surfaces_as_remote_io() -> Result<()> {
        let transport = MemoryTransport::with_capacity(0);
        transport.connect("127.0.0.1", 0)?;
        let pool = SlabPool::new(
            Arc::new(transport),
            PoolGeometry {
                extent_size: 512,
                cacheline_size: CACHELINE,
                max_pages: 4,
            },
            SizeClasses::new(16, 256),
        );
        assert!(matches!(pool.allocate(10), Err(Error::RemoteIo(_))));
        Ok(())
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() -> Result<()> {
        let transport = MemoryTransport::new();
        transport.connect("127.0.0.1", 0)?;
        let pool = SlabPool::new(
            Arc::new(transport),
            PoolGeometry {
                extent_size: 4096,
                cacheline_size: 1024,
                max_pages: 256,
            },
            SizeClasses::new(16, 256),
        );

        let all: Vec<SlotDescriptor> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    let pool = &pool;
                    s.spawn(move || {
                        (0..200)
                            .map(|i| pool.allocate(16 + (t * 31 + i) % 200))
                            .collect::<Result<Vec<_>>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap().unwrap())
                .collect()
        });

        let unique: HashSet<_> = all
            .iter()
            .map(|d| (d.page_id, d.cacheline_id, d.slot_id))
            .collect();
        assert_eq!(unique.len(), all.len());
        assert_eq!(pool.stats().slots_in_use, all.len());

        for slot in all {
            pool.free(slot)?;
        }
        assert_eq!(pool.stats().slots_in_use, 0);
        Ok(())
    }
}

//! Busy-wait reader/writer lock for bucket groups
//!
//! Critical sections under these locks are a handful of loads and stores on
//! a bucket chain, so threads spin instead of parking. The lock is not
//! reentrant and not fair.

use parking_lot::lock_api::{GuardSend, RawRwLock};
use std::hint::spin_loop;
use std::sync::atomic::{AtomicU32, Ordering};

/// Lock word value while a writer holds the lock
const WRITER: u32 = u32::MAX;

/// Raw spin lock; use through [`SpinRwLock`]
pub struct RawSpinRwLock {
    /// 0 = free, WRITER = exclusive, otherwise the reader count
    state: AtomicU32,
}

unsafe impl RawRwLock for RawSpinRwLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        state: AtomicU32::new(0),
    };

    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        while !self.try_lock_shared() {
            spin_loop();
        }
    }

    fn try_lock_shared(&self) -> bool {
        let current = self.state.load(Ordering::Relaxed);
        current < WRITER - 1
            && self
                .state
                .compare_exchange_weak(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    unsafe fn unlock_shared(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }

    fn lock_exclusive(&self) {
        while !self.try_lock_exclusive() {
            spin_loop();
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock_exclusive(&self) {
        self.state.store(0, Ordering::Release);
    }
}

/// Reader/writer spin lock guarding a value
pub type SpinRwLock<T> = parking_lot::lock_api::RwLock<RawSpinRwLock, T>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_readers_share_writers_exclude() {
        let lock = SpinRwLock::new(5u32);
        {
            let a = lock.read();
            let b = lock.read();
            assert_eq!(*a + *b, 10);
            assert!(lock.try_write().is_none());
        }
        {
            let mut w = lock.write();
            *w = 7;
            assert!(lock.try_read().is_none());
        }
        assert_eq!(*lock.read(), 7);
    }

    #[test]
    fn test_concurrent_increments() {
        let lock = Arc::new(SpinRwLock::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.write() += 1;
                        let _ = *lock.read();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.read(), 8000);
    }
}

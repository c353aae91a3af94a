//! Slab Allocator
//!
//! Carves registered remote memory into fixed-size slots organized by size
//! class.
//!
//! # Architecture
//!
//! ```text
//! SlabPool
//!   ├─→ class 16B   → active: page 0   not_full: [4]
//!   ├─→ class 32B   → active: page 2   not_full: []
//!   ├─→ class 208B  → active: page 1   not_full: [3, 5]
//!   └─→ empty: [6]                      (any class, reformatted on reuse)
//!
//! Page (one remote extent)
//!   └─→ cacheline 0..N  → Bitmap of slots
//!
//! SlotDescriptor(page, cacheline, slot, size)
//!   └─→ page.start_addr + cacheline * CACHELINE + slot * size_class
//! ```
//!
//! Bitmaps are lock-free; pages guard their layout with a reader/writer
//! lock; the pool swaps active pages by CAS and only serializes when it has
//! to register new remote memory.

pub mod bitmap;
pub mod page;
pub mod pool;
pub mod size_class;
pub mod slot;

pub use bitmap::Bitmap;
pub use page::{Page, PageState};
pub use pool::{PoolGeometry, PoolStats, SlabPool};
pub use size_class::{calculate_size_classes, SizeClasses};
pub use slot::{CachelineId, PageId, PageInfo, SlotDescriptor, SlotIndex};

//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! Engine
//!   └─→ Shard × N  (selected by key hash)
//!        ├─→ index::IndexShard   16-byte key → SlotDescriptor
//!        ├─→ slab::SlabPool      size-classed slots in remote extents
//!        └─→ cache::*Cache       write-back cachelines (LRU or clock)
//! ```
//!
//! Everything here lives in process memory only; remote memory holds the
//! value bytes and nothing else.

pub mod cache;
pub mod engine;
pub mod index;
pub mod slab;

pub use cache::{CacheStats, ClockCache, LruCache, RemoteLine, WriteBackCache};
pub use engine::{Engine, EngineStats};
pub use index::{IndexShard, Key, KEY_SIZE};
pub use slab::{PoolStats, SlabPool, SlotDescriptor};

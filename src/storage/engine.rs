//! Engine: key-value operations over remote memory
//!
//! # Architecture
//!
//! ```text
//! write/read/delete(key)
//!   └─→ shard = hash(key) % shards
//!        ├─→ key lock stripe    (per-key ordering)
//!        ├─→ IndexShard         key → SlotDescriptor
//!        ├─→ SlabPool           SlotDescriptor ↔ remote slot
//!        └─→ WriteBackCache     bytes ↔ remote cacheline
//! ```
//!
//! Shards share no mutable state. Within a shard, operations on one key are
//! serialized by its lock stripe: writers and deletes hold it exclusively,
//! readers share it.
//!
//! Every operation also holds the engine gate shared; `start` and `stop`
//! take it exclusively, so a shutdown flush sees no write in flight.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::storage::cache::{self, CacheStats, RemoteLine, WriteBackCache};
use crate::storage::index::{IndexShard, Key};
use crate::storage::slab::{PoolGeometry, PoolStats, SizeClasses, SlabPool, SlotDescriptor};
use crate::transport::RemoteTransport;
use parking_lot::{RwLock, RwLockReadGuard};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

struct Shard {
    index: IndexShard,
    pool: SlabPool,
    cache: Box<dyn WriteBackCache>,
    key_locks: Box<[RwLock<()>]>,
}

impl Shard {
    fn key_lock(&self, hash: u64) -> &RwLock<()> {
        &self.key_locks[(hash >> 32) as usize % self.key_locks.len()]
    }

    /// Where the bytes of `slot` live in the cache
    fn resolve(&self, slot: SlotDescriptor) -> Result<(RemoteLine, usize)> {
        let page = self.pool.page_info(slot.page_id)?;
        let line = RemoteLine {
            addr: slot.cacheline_addr(&page, self.pool.cacheline_size()),
            token: page.token,
        };
        Ok((line, slot.offset_in_cacheline(&page)))
    }

    fn store(&self, slot: SlotDescriptor, value: &[u8]) -> Result<()> {
        let (line, offset) = self.resolve(slot)?;
        self.cache.insert(line, offset, value)
    }

    fn load(&self, slot: SlotDescriptor, out: &mut [u8]) -> Result<()> {
        let (line, offset) = self.resolve(slot)?;
        self.cache.find(line, offset, out)
    }

    /// Allocate a slot and fill it; the slot is freed again if the write fails
    fn place(&self, value: &[u8]) -> Result<SlotDescriptor> {
        let slot = self.pool.allocate(value.len())?;
        if let Err(e) = self.store(slot, value) {
            self.pool.free(slot)?;
            return Err(e);
        }
        Ok(slot)
    }

    fn write(&self, key: &Key, value: &[u8]) -> Result<()> {
        let Some(entry) = self.index.find(key) else {
            let slot = self.place(value)?;
            if let Err(e) = self.index.insert(key, slot) {
                self.pool.free(slot)?;
                return Err(e);
            }
            return Ok(());
        };

        let old = entry.location();
        let page = self.pool.page_info(old.page_id)?;
        if self.pool.classes().can_fit(value.len(), page.size_class) {
            let slot = old.with_value_size(value.len() as u16);
            self.store(slot, value)?;
            entry.set_location(slot);
        } else {
            let slot = self.place(value)?;
            entry.set_location(slot);
            self.pool.free(old)?;
            debug!(from = %old, to = %slot, "Moved value to a new size class");
        }
        Ok(())
    }

    fn read(&self, key: &Key, out: &mut Vec<u8>) -> Result<bool> {
        let Some(entry) = self.index.find(key) else {
            return Ok(false);
        };
        let slot = entry.location();
        out.resize(slot.value_size as usize, 0);
        self.load(slot, out)?;
        Ok(true)
    }

    fn delete(&self, key: &Key) -> Result<bool> {
        let removed = match self.index.remove(key) {
            Ok(removed) => removed,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.index.release_entry(removed.arena_index)?;
        self.pool.free(removed.location)?;
        Ok(true)
    }
}

/// Compute-side key-value engine
pub struct Engine {
    config: EngineConfig,
    transport: Arc<dyn RemoteTransport>,
    shards: Box<[Shard]>,
    gate: RwLock<()>,
    running: AtomicBool,
}

impl Engine {
    /// Create an engine; nothing is registered remotely until [`start`](Self::start)
    pub fn new(config: EngineConfig, transport: Arc<dyn RemoteTransport>) -> Result<Self> {
        config.validate()?;

        let classes = SizeClasses::new(config.size_class_step, config.max_value_size);
        let geometry = PoolGeometry {
            extent_size: config.extent_size,
            cacheline_size: config.cacheline_size,
            max_pages: config.max_pages_per_shard,
        };
        let shards = (0..config.shards)
            .map(|_| Shard {
                index: IndexShard::new(config.buckets_per_shard, config.index_capacity_per_shard),
                pool: SlabPool::new(Arc::clone(&transport), geometry, classes),
                cache: cache::build(
                    config.cache_policy,
                    Arc::clone(&transport),
                    config.cache_nodes_per_shard,
                    config.cacheline_size,
                ),
                key_locks: (0..config.key_lock_stripes).map(|_| RwLock::new(())).collect(),
            })
            .collect();

        info!(
            shards = config.shards,
            size_classes = classes.count(),
            cache_policy = ?config.cache_policy,
            "Engine created"
        );

        Ok(Self {
            config,
            transport,
            shards,
            gate: RwLock::new(()),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Connect to the memory node and accept operations
    pub fn start(&self, address: &str, port: u16) -> Result<()> {
        let _gate = self.gate.write();
        if self.alive() {
            debug!("Engine already running");
            return Ok(());
        }
        self.transport.connect(address, port)?;
        self.running.store(true, Ordering::SeqCst);
        info!(address, port, "Engine started");
        Ok(())
    }

    /// Flush every cache, then stop accepting operations and disconnect
    ///
    /// A failed flush leaves the engine running with its dirty lines intact,
    /// so `stop` can be retried.
    pub fn stop(&self) -> Result<()> {
        let _gate = self.gate.write();
        if !self.alive() {
            return Ok(());
        }

        let written: usize = self
            .shards
            .par_iter()
            .map(|shard| shard.cache.flush())
            .collect::<Result<Vec<_>>>()
            .map_err(|e| {
                warn!(error = %e, "Cache flush failed during shutdown");
                e
            })?
            .into_iter()
            .sum();

        self.running.store(false, Ordering::SeqCst);
        self.transport.disconnect();
        info!(flushed_lines = written, "Engine stopped");
        Ok(())
    }

    pub fn alive(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Store `value` under `key`, replacing any previous value
    pub fn write(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _gate = self.enter()?;
        let key = Key::try_from(key)?;
        if value.len() > self.config.max_value_size {
            return Err(Error::InvalidArgument(format!(
                "value of {} bytes exceeds maximum of {} bytes",
                value.len(),
                self.config.max_value_size
            )));
        }

        let (id, shard, hash) = self.shard(&key);
        let _guard = shard.key_lock(hash).write();
        self.escalate(id, shard.write(&key, value))
    }

    /// Fetch the value stored under `key`
    pub fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut value = Vec::new();
        Ok(self.read_into(key, &mut value)?.then_some(value))
    }

    /// Fetch the value under `key` into `out`, resizing it to the value length
    ///
    /// Returns `false` (leaving `out` untouched) if the key is absent.
    pub fn read_into(&self, key: &[u8], out: &mut Vec<u8>) -> Result<bool> {
        let _gate = self.enter()?;
        let key = Key::try_from(key)?;

        let (id, shard, hash) = self.shard(&key);
        let _guard = shard.key_lock(hash).read();
        self.escalate(id, shard.read(&key, out))
    }

    /// Remove `key`; returns whether it was present
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let _gate = self.enter()?;
        let key = Key::try_from(key)?;

        let (id, shard, hash) = self.shard(&key);
        let _guard = shard.key_lock(hash).write();
        self.escalate(id, shard.delete(&key))
    }

    /// Live keys across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.index.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            shards: self.shards.len(),
            ..Default::default()
        };
        for shard in self.shards.iter() {
            stats.keys += shard.index.len();
            stats.pool.merge(&shard.pool.stats());
            stats.cache.merge(&shard.cache.stats());
        }
        stats
    }

    fn shard(&self, key: &Key) -> (usize, &Shard, u64) {
        let hash = key.hash64();
        let id = hash as usize % self.shards.len();
        (id, &self.shards[id], hash)
    }

    /// Hold the gate shared for one operation
    fn enter(&self) -> Result<RwLockReadGuard<'_, ()>> {
        let gate = self.gate.read();
        if self.alive() {
            Ok(gate)
        } else {
            Err(Error::NotRunning)
        }
    }

    /// Log failures; a broken allocator invariant is fatal
    fn escalate<T>(&self, shard: usize, result: Result<T>) -> Result<T> {
        match &result {
            Err(Error::InvariantViolation(msg)) => {
                error!(shard, error = %msg, "Allocator invariant violated");
                panic!("allocator invariant violated in shard {}: {}", shard, msg);
            }
            Err(e @ Error::RemoteIo(_)) => warn!(shard, error = %e, "Remote I/O failed"),
            Err(e @ Error::AllocationExhausted(_)) => {
                warn!(shard, error = %e, "Remote memory exhausted")
            }
            _ => {}
        }
        result
    }
}

/// Engine-wide statistics
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub shards: usize,
    /// Live keys
    pub keys: usize,
    pub pool: PoolStats,
    pub cache: CacheStats,
}

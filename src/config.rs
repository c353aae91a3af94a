//! Engine configuration
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `REMOTEKV_*` environment variables (e.g. `REMOTEKV_SHARDS=32`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Default remote extent registered per page (1 MiB).
pub const DEFAULT_EXTENT_SIZE: usize = 1 << 20;

/// Default cacheline size (64 KiB). One cache node buffers one cacheline.
pub const DEFAULT_CACHELINE_SIZE: usize = 1 << 16;

/// Default size-class quantum.
pub const DEFAULT_SIZE_CLASS_STEP: usize = 16;

/// Eviction policy for the per-shard write-back cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Doubly linked recency list; hits move to the front.
    Lru,
    /// Fixed ring with visited flags and a moving hand.
    Clock,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of independent index/pool/cache shards
    pub shards: usize,
    /// Hash buckets per index shard (a prime spreads keys best)
    pub buckets_per_shard: usize,
    /// Arena entries per index shard, i.e. live keys per shard
    pub index_capacity_per_shard: usize,
    /// Upper bound on pages (remote extents) per shard
    pub max_pages_per_shard: usize,
    /// Bytes registered with the remote node per page
    pub extent_size: usize,
    /// Bytes per cacheline; slots never straddle a cacheline
    pub cacheline_size: usize,
    /// Size-class quantum in bytes
    pub size_class_step: usize,
    /// Largest value accepted by `write`
    pub max_value_size: usize,
    /// Preallocated cache nodes per shard
    pub cache_nodes_per_shard: usize,
    /// Cache eviction policy
    pub cache_policy: CachePolicy,
    /// Striped per-key operation locks per shard
    pub key_lock_stripes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            buckets_per_shard: 16_381,
            index_capacity_per_shard: 1 << 16,
            max_pages_per_shard: 256,
            extent_size: DEFAULT_EXTENT_SIZE,
            cacheline_size: DEFAULT_CACHELINE_SIZE,
            size_class_step: DEFAULT_SIZE_CLASS_STEP,
            max_value_size: 1024,
            cache_nodes_per_shard: 32,
            cache_policy: CachePolicy::Clock,
            key_lock_stripes: 64,
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!(path = ?path, "Loading engine configuration file");
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("REMOTEKV").try_parsing(true),
        );

        let cfg: EngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: EngineConfig = toml::from_str(s)
            .map_err(|e| Error::Config(format!("Invalid TOML configuration: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize configuration: {}", e)))
    }

    /// Number of cachelines in one page
    pub fn cachelines_per_page(&self) -> usize {
        self.extent_size / self.cacheline_size
    }

    /// Check that the geometry fits the slot descriptor and page layout
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("shards", self.shards),
            ("buckets_per_shard", self.buckets_per_shard),
            ("index_capacity_per_shard", self.index_capacity_per_shard),
            ("max_pages_per_shard", self.max_pages_per_shard),
            ("cache_nodes_per_shard", self.cache_nodes_per_shard),
            ("key_lock_stripes", self.key_lock_stripes),
            ("size_class_step", self.size_class_step),
            ("max_value_size", self.max_value_size),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }

        if self.cacheline_size == 0 || self.extent_size % self.cacheline_size != 0 {
            return Err(Error::Config(format!(
                "extent_size {} must be a non-zero multiple of cacheline_size {}",
                self.extent_size, self.cacheline_size
            )));
        }
        if self.cachelines_per_page() == 0 || self.cachelines_per_page() > u16::MAX as usize {
            return Err(Error::Config(format!(
                "a page must hold between 1 and {} cachelines, got {}",
                u16::MAX,
                self.cachelines_per_page()
            )));
        }
        if self.cacheline_size % self.size_class_step != 0 {
            return Err(Error::Config(format!(
                "cacheline_size {} must be a multiple of size_class_step {}",
                self.cacheline_size, self.size_class_step
            )));
        }
        if self.cacheline_size / self.size_class_step > u16::MAX as usize + 1 {
            return Err(Error::Config(format!(
                "cacheline_size {} holds more than {} slots of {} bytes",
                self.cacheline_size,
                u16::MAX as usize + 1,
                self.size_class_step
            )));
        }
        let largest_class = self.max_value_size.div_ceil(self.size_class_step) * self.size_class_step;
        if largest_class > self.cacheline_size || self.max_value_size > u16::MAX as usize {
            return Err(Error::Config(format!(
                "max_value_size {} must fit one cacheline ({} bytes) and a 16-bit size field",
                self.max_value_size, self.cacheline_size
            )));
        }
        if self.max_pages_per_shard > u16::MAX as usize {
            return Err(Error::Config(format!(
                "max_pages_per_shard {} exceeds the 16-bit page id space",
                self.max_pages_per_shard
            )));
        }
        if self.index_capacity_per_shard >= u32::MAX as usize {
            return Err(Error::Config(
                "index_capacity_per_shard exceeds the 32-bit arena index space".to_string(),
            ));
        }
        Ok(())
    }
}

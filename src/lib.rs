// remotekv - compute-side engine of a disaggregated key-value store
// Keys live in a local sharded index; values live in remote memory reached
// through one-sided reads and writes.

#![warn(rust_2018_idioms)]

pub mod config;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use config::{CachePolicy, EngineConfig};
pub use storage::{Engine, EngineStats, Key, KEY_SIZE};
pub use transport::{AccessToken, MemoryTransport, RemoteExtent, RemoteTransport};

/// remotekv error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        /// A bitmap, page or slab pool ran out of capacity.
        #[error("Allocation exhausted: {0}")]
        AllocationExhausted(String),

        /// The transport failed a read, write or registration.
        #[error("Remote I/O failure: {0}")]
        RemoteIo(String),

        #[error("Not found: {0}")]
        NotFound(String),

        /// Allocator bookkeeping is corrupt. Continuing risks aliased slots.
        #[error("Invariant violation: {0}")]
        InvariantViolation(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Engine is not running")]
        NotRunning,
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

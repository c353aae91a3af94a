//! Remote memory transport boundary
//!
//! The engine never talks to the network directly. Everything it needs from
//! the memory node goes through [`RemoteTransport`]: register an extent, then
//! read or write byte ranges inside it by address and access token. Calls are
//! synchronous and either complete fully or fail; retry policy lives behind
//! this trait, not in the engine.

pub mod memory;

use crate::error::Result;

pub use memory::{MemoryTransport, TransportStats};

/// Credential required to address a registered remote extent
pub type AccessToken = u32;

/// A registered range of remote memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteExtent {
    /// First remote address of the extent
    pub addr: u64,
    /// Token authorizing one-sided access to the extent
    pub token: AccessToken,
    /// Length in bytes
    pub len: usize,
}

/// One-sided remote memory operations
pub trait RemoteTransport: Send + Sync {
    /// Establish the connection to the memory node
    fn connect(&self, address: &str, port: u16) -> Result<()>;

    /// Tear down the connection
    fn disconnect(&self);

    /// Ask the memory node for a new extent of `size` bytes
    fn register_extent(&self, size: usize) -> Result<RemoteExtent>;

    /// Fill `buf` from remote memory starting at `remote_addr`
    fn remote_read(&self, buf: &mut [u8], remote_addr: u64, token: AccessToken) -> Result<()>;

    /// Copy `buf` to remote memory starting at `remote_addr`
    fn remote_write(&self, buf: &[u8], remote_addr: u64, token: AccessToken) -> Result<()>;
}

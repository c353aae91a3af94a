//! In-process memory node
//!
//! Stands in for the remote side: extents are zero-filled local buffers keyed
//! by access token. Used by the tests and by `remotekv check`.

use super::{AccessToken, RemoteExtent, RemoteTransport};
use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// First address handed out, so that address 0 is never valid
const BASE_ADDR: u64 = 0x1000_0000;

struct Extent {
    addr: u64,
    data: Mutex<Box<[u8]>>,
}

impl Extent {
    fn check_range(&self, remote_addr: u64, len: usize, capacity: usize) -> Result<usize> {
        let offset = remote_addr
            .checked_sub(self.addr)
            .map(|o| o as usize)
            .filter(|o| o.checked_add(len).is_some_and(|end| end <= capacity))
            .ok_or_else(|| {
                Error::RemoteIo(format!(
                    "range {:#x}+{} outside extent at {:#x} ({} bytes)",
                    remote_addr, len, self.addr, capacity
                ))
            })?;
        Ok(offset)
    }
}

/// In-memory remote node
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    extents: DashMap<AccessToken, Arc<Extent>>,
    next_addr: AtomicU64,
    next_token: AtomicU32,
    connected: AtomicBool,
    /// Remaining registration budget in bytes; `None` means unlimited
    budget: Mutex<Option<usize>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    registrations: AtomicUsize,
}

impl MemoryTransport {
    /// Create an unlimited memory node
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a memory node that refuses registrations beyond `bytes`
    pub fn with_capacity(bytes: usize) -> Self {
        let transport = Self::default();
        *transport.inner.budget.lock() = Some(bytes);
        transport
    }

    /// Make every subsequent read fail (or succeed again)
    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Copy bytes straight out of the node, bypassing connection state and counters
    pub fn peek(&self, remote_addr: u64, token: AccessToken, len: usize) -> Result<Vec<u8>> {
        let extent = self.extent(token)?;
        let data = extent.data.lock();
        let offset = extent.check_range(remote_addr, len, data.len())?;
        Ok(data[offset..offset + len].to_vec())
    }

    /// Operation counters
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            reads: self.inner.reads.load(Ordering::Relaxed),
            writes: self.inner.writes.load(Ordering::Relaxed),
            registrations: self.inner.registrations.load(Ordering::Relaxed),
        }
    }

    fn extent(&self, token: AccessToken) -> Result<Arc<Extent>> {
        self.inner
            .extents
            .get(&token)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::RemoteIo(format!("unknown access token {}", token)))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::RemoteIo("transport is not connected".to_string()))
        }
    }
}

impl RemoteTransport for MemoryTransport {
    fn connect(&self, address: &str, port: u16) -> Result<()> {
        info!(address, port, "Connected to in-process memory node");
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    fn register_extent(&self, size: usize) -> Result<RemoteExtent> {
        self.ensure_connected()?;
        if size == 0 {
            return Err(Error::RemoteIo("cannot register an empty extent".to_string()));
        }
        {
            let mut budget = self.inner.budget.lock();
            if let Some(remaining) = budget.as_mut() {
                if *remaining < size {
                    return Err(Error::RemoteIo(format!(
                        "memory node has {} bytes left, {} requested",
                        remaining, size
                    )));
                }
                *remaining -= size;
            }
        }

        let offset = self.inner.next_addr.fetch_add(size as u64, Ordering::SeqCst);
        let addr = BASE_ADDR + offset;
        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        let extent = Extent {
            addr,
            data: Mutex::new(vec![0u8; size].into_boxed_slice()),
        };
        self.inner.extents.insert(token, Arc::new(extent));
        self.inner.registrations.fetch_add(1, Ordering::Relaxed);

        debug!(addr = format_args!("{:#x}", addr), token, size, "Registered extent");
        Ok(RemoteExtent {
            addr,
            token,
            len: size,
        })
    }

    fn remote_read(&self, buf: &mut [u8], remote_addr: u64, token: AccessToken) -> Result<()> {
        self.ensure_connected()?;
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::RemoteIo(format!("read at {:#x} failed", remote_addr)));
        }
        let extent = self.extent(token)?;
        let data = extent.data.lock();
        let offset = extent.check_range(remote_addr, buf.len(), data.len())?;
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remote_write(&self, buf: &[u8], remote_addr: u64, token: AccessToken) -> Result<()> {
        self.ensure_connected()?;
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::RemoteIo(format!("write at {:#x} failed", remote_addr)));
        }
        let extent = self.extent(token)?;
        let mut data = extent.data.lock();
        let offset = extent.check_range(remote_addr, buf.len(), data.len())?;
        data[offset..offset + buf.len()].copy_from_slice(buf);
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Transport operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub reads: u64,
    pub writes: u64,
    pub registrations: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> Result<MemoryTransport> {
        let t = MemoryTransport::new();
        t.connect("127.0.0.1", 22222)?;
        Ok(t)
    }

    #[test]
    fn test_register_read_write() -> Result<()> {
        let t = connected()?;
        let extent = t.register_extent(4096)?;
        assert_eq!(extent.len, 4096);

        t.remote_write(b"remote bytes", extent.addr + 100, extent.token)?;
        let mut buf = [0u8; 12];
        t.remote_read(&mut buf, extent.addr + 100, extent.token)?;
        assert_eq!(&buf, b"remote bytes");

        let stats = t.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.registrations, 1);
        Ok(())
    }

    #[test]
    fn test_extents_do_not_overlap() -> Result<()> {
        let t = connected()?;
        let a = t.register_extent(4096)?;
        let b = t.register_extent(4096)?;
        assert_ne!(a.token, b.token);
        assert!(b.addr >= a.addr + a.len as u64);
        Ok(())
    }

    #[test]
    fn test_rejects_out_of_range_and_wrong_token() -> Result<()> {
        let t = connected()?;
        let extent = t.register_extent(64)?;
        let mut buf = [0u8; 16];
        assert!(matches!(
            t.remote_read(&mut buf, extent.addr + 56, extent.token),
            Err(Error::RemoteIo(_))
        ));
        assert!(matches!(
            t.remote_read(&mut buf, extent.addr, extent.token + 7),
            Err(Error::RemoteIo(_))
        ));
        Ok(())
    }

    #[test]
    fn test_requires_connection() {
        let t = MemoryTransport::new();
        assert!(matches!(t.register_extent(64), Err(Error::RemoteIo(_))));
    }

    #[test]
    fn test_capacity_and_failure_injection() -> Result<()> {
        let t = MemoryTransport::with_capacity(128);
        t.connect("127.0.0.1", 22222)?;
        let extent = t.register_extent(128)?;
        assert!(t.register_extent(1).is_err());

        t.fail_writes(true);
        assert!(t.remote_write(b"x", extent.addr, extent.token).is_err());
        t.fail_writes(false);
        t.remote_write(b"x", extent.addr, extent.token)?;
        assert_eq!(t.peek(extent.addr, extent.token, 1)?, b"x".to_vec());
        Ok(())
    }
}

//! Key Index
//!
//! Fixed-width keys mapped to slot descriptors. The engine owns one
//! [`IndexShard`] per shard; each shard is an independent chained hash table
//! over a preallocated [`arena`].

pub mod arena;
pub mod shard;
pub mod spin;

pub use shard::{next_prime, EntryRef, IndexShard, RemovedEntry, BUCKETS_PER_GROUP};
pub use spin::{RawSpinRwLock, SpinRwLock};

use crate::error::{Error, Result};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::Hasher;

/// Width of every key in bytes
pub const KEY_SIZE: usize = 16;

/// Fixed-width application key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Stable hash used for shard, bucket and lock-stripe selection
    pub fn hash64(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        hasher.write(&self.0);
        hasher.finish()
    }

    pub(crate) fn words(&self) -> [u64; 2] {
        let (lo, hi) = self.0.split_at(8);
        [
            u64::from_le_bytes(lo.try_into().unwrap_or_default()),
            u64::from_le_bytes(hi.try_into().unwrap_or_default()),
        ]
    }
}

impl TryFrom<&[u8]> for Key {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            Error::InvalidArgument(format!(
                "key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) if text.chars().all(|c| !c.is_control()) => write!(f, "{:?}", text),
            _ => {
                for byte in self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_slice() -> Result<()> {
        let key = Key::try_from(&b"0000000000000001"[..])?;
        assert_eq!(key.as_bytes(), b"0000000000000001");
        assert_eq!(key.to_string(), "\"0000000000000001\"");

        assert!(matches!(
            Key::try_from(&b"short"[..]),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_hash_is_stable_and_words_distinguish() {
        let a = Key::new(*b"aaaaaaaaaaaaaaaa");
        let b = Key::new(*b"aaaaaaaabaaaaaaa");
        assert_eq!(a.hash64(), Key::new(*b"aaaaaaaaaaaaaaaa").hash64());
        assert_ne!(a.words(), b.words());
        assert_eq!(Key::new([0xff; 16]).to_string(), "ff".repeat(16));
    }
}

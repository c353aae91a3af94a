//! Slot descriptors: where a stored value lives

use crate::transport::AccessToken;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type PageId = u16;
pub type CachelineId = u16;
pub type SlotIndex = u16;

/// Location and size of one stored value
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SlotDescriptor {
    /// Page (remote extent) holding the value
    pub page_id: PageId,
    /// Cacheline within the page
    pub cacheline_id: CachelineId,
    /// Slot within the cacheline
    pub slot_id: SlotIndex,
    /// Bytes of the value actually stored
    pub value_size: u16,
}

impl SlotDescriptor {
    /// Create a new slot descriptor
    pub fn new(page_id: PageId, cacheline_id: CachelineId, slot_id: SlotIndex, value_size: u16) -> Self {
        Self {
            page_id,
            cacheline_id,
            slot_id,
            value_size,
        }
    }

    /// Same slot with a different recorded size
    pub fn with_value_size(self, value_size: u16) -> Self {
        Self { value_size, ..self }
    }

    /// Pack into one word so an index entry can swap it atomically
    pub fn pack(&self) -> u64 {
        (self.page_id as u64) << 48
            | (self.cacheline_id as u64) << 32
            | (self.slot_id as u64) << 16
            | self.value_size as u64
    }

    pub fn unpack(word: u64) -> Self {
        Self {
            page_id: (word >> 48) as u16,
            cacheline_id: (word >> 32) as u16,
            slot_id: (word >> 16) as u16,
            value_size: word as u16,
        }
    }

    /// Remote address of the cacheline holding this slot
    pub fn cacheline_addr(&self, page: &PageInfo, cacheline_size: usize) -> u64 {
        page.start_addr + self.cacheline_id as u64 * cacheline_size as u64
    }

    /// Byte offset of this slot inside its cacheline
    pub fn offset_in_cacheline(&self, page: &PageInfo) -> usize {
        self.slot_id as usize * page.size_class
    }

    /// Remote address of the first byte of the value
    pub fn remote_addr(&self, page: &PageInfo, cacheline_size: usize) -> u64 {
        self.cacheline_addr(page, cacheline_size) + self.offset_in_cacheline(page) as u64
    }
}

impl fmt::Display for SlotDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Slot(page={}, cacheline={}, slot={}, size={})",
            self.page_id, self.cacheline_id, self.slot_id, self.value_size
        )
    }
}

/// What the engine needs to address a page remotely
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub start_addr: u64,
    pub token: AccessToken,
    /// Slot size in bytes
    pub size_class: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_preserves_every_field() {
        let slot = SlotDescriptor::new(513, 15, 4095, 65535);
        assert_eq!(SlotDescriptor::unpack(slot.pack()), slot);
        assert_eq!(SlotDescriptor::unpack(0), SlotDescriptor::default());
    }

    #[test]
    fn test_remote_address() {
        let page = PageInfo {
            start_addr: 0x1000_0000,
            token: 7,
            size_class: 208,
        };
        let slot = SlotDescriptor::new(0, 3, 5, 200);
        assert_eq!(slot.cacheline_addr(&page, 65536), 0x1000_0000 + 3 * 65536);
        assert_eq!(slot.offset_in_cacheline(&page), 5 * 208);
        assert_eq!(slot.remote_addr(&page, 65536), 0x1000_0000 + 3 * 65536 + 1040);
    }

    #[test]
    fn test_with_value_size_keeps_location() {
        let slot = SlotDescriptor::new(2, 1, 9, 40);
        let resized = slot.with_value_size(12);
        assert_eq!(resized.value_size, 12);
        assert_eq!((resized.page_id, resized.cacheline_id, resized.slot_id), (2, 1, 9));
        assert_eq!(format!("{}", resized), "Slot(page=2, cacheline=1, slot=9, size=12)");
    }
}

//! Atomic block bitmap.
//!
//! One bit per 4 KiB block, LSB-first within each byte. Multiple producers
//! update the map without per-entry locks, so every mutation is a
//! byte-granular atomic fetch-or / fetch-and. Readers may observe a stale 0
//! but never a spurious 1.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::BLOCK_SIZE;

/// Number of bytes needed to cover `blocks` bits.
pub const fn byte_len(blocks: u64) -> usize {
    blocks.div_ceil(8) as usize
}

/// Number of 4 KiB blocks spanned by a virtual size.
pub const fn block_count(virtual_size: u64) -> u64 {
    virtual_size.div_ceil(BLOCK_SIZE)
}

/// Lock-free bitmap over the blocks of an image or CoW entry.
#[derive(Debug)]
pub struct BlockBitmap {
    bytes: Box<[AtomicU8]>,
    blocks: u64,
}

impl BlockBitmap {
    /// All-zero map covering `blocks` bits.
    pub fn new(blocks: u64) -> Self {
        let bytes = (0..byte_len(blocks)).map(|_| AtomicU8::new(0)).collect();
        Self { bytes, blocks }
    }

    /// Wraps a persisted map. `raw` must be exactly [`byte_len`] bytes.
    pub fn from_bytes(raw: &[u8], blocks: u64) -> Option<Self> {
        if raw.len() != byte_len(blocks) {
            return None;
        }
        let bytes = raw.iter().map(|&b| AtomicU8::new(b)).collect();
        Some(Self { bytes, blocks })
    }

    pub fn block_count(&self) -> u64 {
        self.blocks
    }

    pub fn get(&self, block: u64) -> bool {
        if block >= self.blocks {
            return false;
        }
        let byte = self.bytes[(block / 8) as usize].load(Ordering::Acquire);
        byte & (1 << (block % 8)) != 0
    }

    pub fn set(&self, block: u64) {
        self.set_range(block, block + 1);
    }

    /// Sets `[first, end)` to 1. Atomic per byte.
    pub fn set_range(&self, first: u64, end: u64) {
        self.apply_range(first, end, true);
    }

    /// Clears `[first, end)` to 0. Atomic per byte.
    pub fn clear_range(&self, first: u64, end: u64) {
        self.apply_range(first, end, false);
    }

    fn apply_range(&self, first: u64, end: u64, value: bool) {
        let end = end.min(self.blocks);
        if first >= end {
            return;
        }
        let mut bit = first;
        while bit < end {
            let byte = (bit / 8) as usize;
            let lo = (bit % 8) as u32;
            let hi = (end - 1).min(byte as u64 * 8 + 7) % 8;
            let width = hi as u32 - lo + 1;
            let mask = (0xffu16 >> (8 - width)) as u8;
            let mask = mask << lo;
            if value {
                self.bytes[byte].fetch_or(mask, Ordering::AcqRel);
            } else {
                self.bytes[byte].fetch_and(!mask, Ordering::AcqRel);
            }
            bit = (byte as u64 + 1) * 8;
        }
    }

    /// True when every block in `[first, end)` is present.
    pub fn range_set(&self, first: u64, end: u64) -> bool {
        (first..end.min(self.blocks)).all(|b| self.get(b))
    }

    /// Index of the first clear block at or after `from`, if any.
    pub fn first_clear_from(&self, from: u64) -> Option<u64> {
        (from..self.blocks).find(|&b| !self.get(b))
    }

    pub fn count_set(&self) -> u64 {
        let mut total: u64 = 0;
        for (i, byte) in self.bytes.iter().enumerate() {
            let mut b = byte.load(Ordering::Relaxed);
            // Mask padding bits of the trailing byte
            if i == self.bytes.len() - 1 && self.blocks % 8 != 0 {
                b &= (1u16 << (self.blocks % 8)).wrapping_sub(1) as u8;
            }
            total += b.count_ones() as u64;
        }
        total
    }

    pub fn is_complete(&self) -> bool {
        self.count_set() == self.blocks
    }

    /// Completeness in whole percent, matching what status surfaces expect.
    pub fn completeness_percent(&self) -> u8 {
        if self.blocks == 0 {
            return 100;
        }
        (self.count_set() * 100 / self.blocks) as u8
    }

    /// Copies the current contents for persistence. Concurrent setters may
    /// race the copy; a stale 0 is harmless, the block is refetched.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes
            .iter()
            .map(|b| b.load(Ordering::Acquire))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let map = BlockBitmap::new(20);
        assert!(!map.get(0));
        map.set(0);
        map.set(19);
        assert!(map.get(0));
        assert!(map.get(19));
        assert!(!map.get(1));
        assert_eq!(map.count_set(), 2);
    }

    #[test]
    fn range_crossing_byte_borders() {
        let map = BlockBitmap::new(64);
        map.set_range(5, 27);
        for b in 0..64 {
            assert_eq!(map.get(b), (5..27).contains(&b), "block {b}");
        }
        map.clear_range(8, 16);
        for b in 0..64 {
            assert_eq!(
                map.get(b),
                (5..8).contains(&b) || (16..27).contains(&b),
                "block {b}"
            );
        }
    }

    #[test]
    fn lsb_first_layout() {
        let map = BlockBitmap::new(16);
        map.set(0);
        map.set(9);
        assert_eq!(map.snapshot(), vec![0b0000_0001, 0b0000_0010]);
    }

    #[test]
    fn completeness() {
        let map = BlockBitmap::new(10);
        assert_eq!(map.completeness_percent(), 0);
        map.set_range(0, 5);
        assert_eq!(map.completeness_percent(), 50);
        map.set_range(0, 10);
        assert!(map.is_complete());
        assert_eq!(map.completeness_percent(), 100);
    }

    #[test]
    fn out_of_range_is_ignored() {
        let map = BlockBitmap::new(9);
        map.set_range(7, 200);
        assert_eq!(map.count_set(), 2);
        assert!(!map.is_complete());
        assert_eq!(map.first_clear_from(0), Some(0));
        assert_eq!(map.first_clear_from(7), None);
    }

    #[test]
    fn persistence_round_trip() {
        let map = BlockBitmap::new(12);
        map.set_range(3, 9);
        let raw = map.snapshot();
        assert_eq!(raw.len(), byte_len(12));
        let back = BlockBitmap::from_bytes(&raw, 12).unwrap();
        for b in 0..12 {
            assert_eq!(back.get(b), map.get(b));
        }
        assert!(BlockBitmap::from_bytes(&raw, 64).is_none());
    }
}

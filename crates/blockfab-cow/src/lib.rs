//! Copy-on-write overlay for the user-mode client.
//!
//! Client writes land in a local data file addressed through a two-level
//! sparse index; a background uploader ships quiesced dirty blocks to a
//! remote merge service. The origin image is never mutated.

use std::time::Duration;

pub mod error;
pub mod file;
pub mod stats;
pub mod store;
pub mod upload;

pub use error::CowError;
pub use file::{CowFile, OriginReader};
pub use stats::StatsWriter;
pub use store::CowStore;
pub use upload::Uploader;

/// Result type for CoW operations.
pub type Result<T> = std::result::Result<T, CowError>;

pub use blockfab_proto::BLOCK_SIZE;

/// Bytes of dirty/present bitmap per metadata entry (320 blocks).
pub const COW_BITFIELD_SIZE: usize = 40;

/// Blocks covered by one metadata entry.
pub const COW_BLOCKS_PER_ENTRY: u64 = (COW_BITFIELD_SIZE as u64) * 8;

/// Bytes of image data covered by one metadata entry (1.25 MiB).
pub const COW_METADATA_STORAGE_CAPACITY: u64 = COW_BLOCKS_PER_ENTRY * BLOCK_SIZE;

/// Metadata entries per L2 block.
pub const COW_L2_SIZE: usize = 1024;

/// Bytes of image data covered by one L2 block (1.25 GiB).
pub const COW_L2_STORAGE_CAPACITY: u64 = COW_L2_SIZE as u64 * COW_METADATA_STORAGE_CAPACITY;

/// Largest supported virtual disk.
pub const COW_MAX_IMAGE_SIZE: u64 = 4 << 40;

/// Quiescence window before a dirty entry becomes eligible for upload.
pub const COW_MIN_UPLOAD_DELAY: Duration = Duration::from_secs(60);

/// Cadence of the statistics task.
pub const COW_STATS_UPDATE_TIME: Duration = Duration::from_secs(5);

/// Parallel transfers during the final drain.
pub const COW_MAX_PARALLEL_UPLOADS: usize = 10;

/// Parallel transfers in steady state.
pub const COW_MAX_PARALLEL_BACKGROUND_UPLOADS: usize = 2;

/// Retry budget per block upload.
pub const COW_UPLOAD_RETRIES: u32 = 5;

/// Magic leading the metadata file.
pub const COW_META_MAGIC: u64 = u64::from_le_bytes(*b"BFCOWMET");

/// Magic leading the data file.
pub const COW_DATA_MAGIC: u64 = u64::from_le_bytes(*b"BFCOWDAT");

/// Index math shared by the store, the read/write paths and the uploader.
pub(crate) fn l1_index(offset: u64) -> usize {
    (offset / COW_L2_STORAGE_CAPACITY) as usize
}

pub(crate) fn l2_index(offset: u64) -> usize {
    ((offset % COW_L2_STORAGE_CAPACITY) / COW_METADATA_STORAGE_CAPACITY) as usize
}

pub(crate) fn bit_index(offset: u64) -> usize {
    ((offset / BLOCK_SIZE) % COW_BLOCKS_PER_ENTRY) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry() {
        assert_eq!(COW_METADATA_STORAGE_CAPACITY, 1_310_720);
        assert_eq!(COW_L2_STORAGE_CAPACITY, 1_342_177_280);
    }

    #[test]
    fn addressing() {
        assert_eq!(l1_index(0), 0);
        assert_eq!(l2_index(0), 0);
        assert_eq!(bit_index(0), 0);

        let off = COW_L2_STORAGE_CAPACITY + 2 * COW_METADATA_STORAGE_CAPACITY + 5 * BLOCK_SIZE;
        assert_eq!(l1_index(off), 1);
        assert_eq!(l2_index(off), 2);
        assert_eq!(bit_index(off), 5);

        assert_eq!(bit_index(COW_METADATA_STORAGE_CAPACITY - 1), 319);
    }
}

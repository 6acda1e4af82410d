//! The on-disk CoW store: a memory-mapped metadata file and an append-only
//! data file.
//!
//! Metadata layout: a fixed header at offset 0, the dense L1 table of
//! signed L2 indices at `meta_data_start` (page aligned), and the L2 arena
//! immediately after. Each L2 block holds [`COW_L2_SIZE`] 64-byte entries:
//! data-file offset, change timestamp, upload counter and a 40-byte
//! dirty/present bitmap at 4 KiB granularity. All mutable fields are
//! updated through atomics on the mapping; there is no per-entry lock.

use std::fs::{File, OpenOptions};
use std::io::Cursor;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use binrw::prelude::*;
use log::info;
use memmap2::MmapMut;

use crate::{
    bit_index, l1_index, l2_index, CowError, BLOCK_SIZE, COW_BITFIELD_SIZE, COW_BLOCKS_PER_ENTRY,
    COW_DATA_MAGIC, COW_L2_SIZE, COW_L2_STORAGE_CAPACITY, COW_MAX_IMAGE_SIZE, COW_META_MAGIC,
    COW_METADATA_STORAGE_CAPACITY,
};

/// On-disk format revision.
pub const COW_FILE_VERSION: u32 = 1;

/// Start of the L1 table; also the page-aligned header reservation.
pub const META_DATA_START: u64 = 8192;

/// Bytes per metadata entry.
const ENTRY_SIZE: usize = 64;

const ENTRY_OFFSET: usize = 0;
const ENTRY_TIME_CHANGED: usize = 8;
const ENTRY_UPLOADS: usize = 16;
const ENTRY_BITFIELD: usize = 24;

// Header field offsets mirrored by `CowMetaHeader`; runtime updates go
// through atomics at these positions.
const HDR_ORIGINAL_SIZE: usize = 16;
const HDR_IMAGE_SIZE: usize = 24;
const HDR_DATA_FILE_SIZE: usize = 32;
const HDR_NEXT_L2: usize = 56;
const HDR_UUID: usize = 80;

const UUID_LEN: usize = 36;
const NAME_LEN: usize = 200;

/// Fixed metadata file header.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct CowMetaHeader {
    pub magic: u64,
    pub version: u32,
    pub blocksize: u32,
    pub original_image_size: u64,
    pub image_size: u64,
    pub data_file_size: u64,
    pub creation_time: u64,
    pub meta_data_start: u64,
    pub next_l2: u64,
    pub bitfield_size: u32,
    reserved: u32,
    pub max_image_size: u64,
    pub uuid: [u8; UUID_LEN + 1],
    pub image_name: [u8; NAME_LEN],
}

/// Encoded header size.
pub const HEADER_SIZE: usize = 80 + UUID_LEN + 1 + NAME_LEN;

fn l1_count_for(max_image_size: u64) -> usize {
    max_image_size.div_ceil(COW_L2_STORAGE_CAPACITY) as usize
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct CowStore {
    meta: MmapMut,
    data: File,
    l1_count: usize,
    l2_arena: usize,
    /// Guards L2 creation and data-offset assignment; everything else is
    /// atomics on the mapping.
    l2_create_lock: Mutex<()>,
    image_name: String,
    image_rid: u16,
}

impl CowStore {
    /// Creates `meta` and `data` under `dir` for a fresh overlay session.
    pub fn create(
        dir: &Path,
        image_name: &str,
        image_rid: u16,
        original_size: u64,
    ) -> crate::Result<CowStore> {
        if original_size > COW_MAX_IMAGE_SIZE {
            return Err(CowError::BeyondMaxSize(original_size));
        }
        let meta_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dir.join("meta"))?;
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dir.join("data"))?;

        let l1_count = l1_count_for(COW_MAX_IMAGE_SIZE);
        let meta_len = META_DATA_START as usize
            + l1_count * 8
            + l1_count * COW_L2_SIZE * ENTRY_SIZE;
        meta_file.set_len(meta_len as u64)?;

        let mut name_buf = [0u8; NAME_LEN];
        let name_bytes = image_name.as_bytes();
        let n = name_bytes.len().min(NAME_LEN);
        name_buf[..n].copy_from_slice(&name_bytes[..n]);

        let header = CowMetaHeader {
            magic: COW_META_MAGIC,
            version: COW_FILE_VERSION,
            blocksize: BLOCK_SIZE as u32,
            original_image_size: original_size,
            image_size: original_size,
            // First data chunk is reserved for the magic header
            data_file_size: COW_METADATA_STORAGE_CAPACITY,
            creation_time: now_secs(),
            meta_data_start: META_DATA_START,
            next_l2: 0,
            bitfield_size: COW_BITFIELD_SIZE as u32,
            reserved: 0,
            max_image_size: COW_MAX_IMAGE_SIZE,
            uuid: [0u8; UUID_LEN + 1],
            image_name: name_buf,
        };
        let mut cursor = Cursor::new(Vec::with_capacity(HEADER_SIZE));
        header
            .write(&mut cursor)
            .map_err(blockfab_proto::ProtoError::from)?;
        meta_file.write_all_at(&cursor.into_inner(), 0)?;

        // The mapping lives as long as the store; the files are ours alone.
        let meta = unsafe { MmapMut::map_mut(&meta_file)? };

        let store = CowStore {
            meta,
            data,
            l1_count,
            l2_arena: META_DATA_START as usize + l1_count * 8,
            l2_create_lock: Mutex::new(()),
            image_name: image_name.to_string(),
            image_rid,
        };
        for i in 0..l1_count {
            store.l1_slot(i).store(-1, Ordering::Relaxed);
        }
        store.data.write_all_at(&COW_DATA_MAGIC.to_le_bytes(), 0)?;
        info!(
            "created cow overlay for {image_name}:{image_rid} ({original_size} bytes)"
        );
        Ok(store)
    }

    /// Reopens an existing overlay, validating both magics. A byte-swapped
    /// magic is reported as a wrong-endian file, not a format error.
    pub fn load(dir: &Path) -> crate::Result<CowStore> {
        let meta_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join("meta"))?;
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join("data"))?;

        let mut raw = vec![0u8; HEADER_SIZE];
        meta_file.read_exact_at(&mut raw, 0)?;
        let header = CowMetaHeader::read(&mut Cursor::new(&raw))
            .map_err(|e| CowError::MetaFormat(e.to_string()))?;
        if header.magic != COW_META_MAGIC {
            if header.magic.swap_bytes() == COW_META_MAGIC {
                return Err(CowError::WrongEndianness);
            }
            return Err(CowError::MetaFormat("unknown magic".into()));
        }
        if header.version != COW_FILE_VERSION {
            return Err(CowError::MetaFormat(format!(
                "version {} not supported",
                header.version
            )));
        }
        if header.meta_data_start != META_DATA_START
            || header.bitfield_size != COW_BITFIELD_SIZE as u32
        {
            return Err(CowError::MetaFormat("layout mismatch".into()));
        }

        let l1_count = l1_count_for(header.max_image_size);
        let needed = META_DATA_START + l1_count as u64 * 8 + header.next_l2 * (COW_L2_SIZE * ENTRY_SIZE) as u64;
        if meta_file.metadata()?.len() < needed {
            return Err(CowError::MetaFormat("file too small for its index".into()));
        }

        let mut data_magic = [0u8; 8];
        data.read_exact_at(&mut data_magic, 0)
            .map_err(|_| CowError::DataFormat("missing magic".into()))?;
        let data_magic = u64::from_le_bytes(data_magic);
        if data_magic != COW_DATA_MAGIC {
            if data_magic.swap_bytes() == COW_DATA_MAGIC {
                return Err(CowError::WrongEndianness);
            }
            return Err(CowError::DataFormat("unknown magic".into()));
        }

        let name_end = header
            .image_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_LEN);
        let image_name = String::from_utf8_lossy(&header.image_name[..name_end]).into_owned();

        let meta = unsafe { MmapMut::map_mut(&meta_file)? };
        info!("loaded cow overlay for {image_name}");
        Ok(CowStore {
            meta,
            data,
            l1_count,
            l2_arena: META_DATA_START as usize + l1_count * 8,
            l2_create_lock: Mutex::new(()),
            image_name,
            image_rid: 0,
        })
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    pub fn image_rid(&self) -> u16 {
        self.image_rid
    }

    // Atomic views into the mapping. The mapping is page aligned and every
    // mutable field sits at an 8-byte-aligned offset.
    fn au64(&self, off: usize) -> &AtomicU64 {
        debug_assert!(off % 8 == 0 && off + 8 <= self.meta.len());
        unsafe { &*(self.meta.as_ptr().add(off) as *const AtomicU64) }
    }

    fn ai64(&self, off: usize) -> &AtomicI64 {
        debug_assert!(off % 8 == 0 && off + 8 <= self.meta.len());
        unsafe { &*(self.meta.as_ptr().add(off) as *const AtomicI64) }
    }

    fn au8(&self, off: usize) -> &AtomicU8 {
        debug_assert!(off < self.meta.len());
        unsafe { &*(self.meta.as_ptr().add(off) as *const AtomicU8) }
    }

    pub fn original_image_size(&self) -> u64 {
        self.au64(HDR_ORIGINAL_SIZE).load(Ordering::Acquire)
    }

    pub fn image_size(&self) -> u64 {
        self.au64(HDR_IMAGE_SIZE).load(Ordering::Acquire)
    }

    /// Grows the recorded image size to at least `candidate`.
    pub fn grow_image_size(&self, candidate: u64) {
        self.au64(HDR_IMAGE_SIZE)
            .fetch_max(candidate, Ordering::AcqRel);
    }

    pub fn data_file_size(&self) -> u64 {
        self.au64(HDR_DATA_FILE_SIZE).load(Ordering::Acquire)
    }

    pub fn uuid(&self) -> String {
        let mut raw = [0u8; UUID_LEN];
        for (i, slot) in raw.iter_mut().enumerate() {
            *slot = self.au8(HDR_UUID + i).load(Ordering::Acquire);
        }
        String::from_utf8_lossy(&raw)
            .trim_end_matches('\0')
            .to_string()
    }

    /// Stores the 36-byte session id handed out by the merge service.
    pub fn set_uuid(&self, uuid: &str) {
        let bytes = uuid.as_bytes();
        let n = bytes.len().min(UUID_LEN);
        for (i, &b) in bytes[..n].iter().enumerate() {
            self.au8(HDR_UUID + i).store(b, Ordering::Relaxed);
        }
    }

    fn l1_slot(&self, i: usize) -> &AtomicI64 {
        self.ai64(META_DATA_START as usize + i * 8)
    }

    /// L2 block index for an L1 slot, if one was allocated.
    pub fn l1_entry(&self, i: usize) -> Option<u64> {
        if i >= self.l1_count {
            return None;
        }
        match self.l1_slot(i).load(Ordering::Acquire) {
            -1 => None,
            v => Some(v as u64),
        }
    }

    pub fn l1_count(&self) -> usize {
        self.l1_count
    }

    /// Allocates (or returns) the L2 block behind an L1 slot. The new block
    /// is fully initialized before it is published, so a reader that sees
    /// the slot set never observes a half-built L2.
    pub fn ensure_l2(&self, l1: usize) -> u64 {
        if let Some(existing) = self.l1_entry(l1) {
            return existing;
        }
        let _guard = self.l2_create_lock.lock().unwrap();
        if let Some(existing) = self.l1_entry(l1) {
            return existing;
        }
        let next = self.au64(HDR_NEXT_L2).load(Ordering::Acquire);
        for entry_idx in 0..COW_L2_SIZE {
            let base = self.entry_base(next, entry_idx);
            self.ai64(base + ENTRY_OFFSET).store(-1, Ordering::Relaxed);
            self.au64(base + ENTRY_TIME_CHANGED)
                .store(0, Ordering::Relaxed);
            self.au64(base + ENTRY_UPLOADS).store(0, Ordering::Relaxed);
            for b in 0..COW_BITFIELD_SIZE {
                self.au8(base + ENTRY_BITFIELD + b).store(0, Ordering::Relaxed);
            }
        }
        self.au64(HDR_NEXT_L2).store(next + 1, Ordering::Release);
        self.l1_slot(l1).store(next as i64, Ordering::Release);
        next
    }

    fn entry_base(&self, l2_block: u64, entry_idx: usize) -> usize {
        self.l2_arena + (l2_block as usize * COW_L2_SIZE + entry_idx) * ENTRY_SIZE
    }

    /// Accessor for the entry covering `offset`, if its L2 exists.
    pub fn entry_at(&self, offset: u64) -> Option<Entry<'_>> {
        let l2_block = self.l1_entry(l1_index(offset))?;
        Some(Entry {
            store: self,
            base: self.entry_base(l2_block, l2_index(offset)),
        })
    }

    /// Accessor creating the L2 on demand.
    pub fn entry_for_write(&self, offset: u64) -> Entry<'_> {
        let l2_block = self.ensure_l2(l1_index(offset));
        Entry {
            store: self,
            base: self.entry_base(l2_block, l2_index(offset)),
        }
    }

    pub fn entry(&self, l1: usize, l2: usize) -> Option<Entry<'_>> {
        let l2_block = self.l1_entry(l1)?;
        Some(Entry {
            store: self,
            base: self.entry_base(l2_block, l2),
        })
    }

    /// Walks every allocated entry under the current image size. The
    /// callback gets the global block number (`l1·1024 + l2`).
    pub fn for_each_entry(&self, mut f: impl FnMut(u64, Entry<'_>)) {
        let size = self.image_size();
        if size == 0 {
            return;
        }
        let l1_max = (1 + (size - 1) / COW_L2_STORAGE_CAPACITY) as usize;
        for l1 in 0..l1_max.min(self.l1_count) {
            let Some(l2_block) = self.l1_entry(l1) else {
                continue;
            };
            for l2 in 0..COW_L2_SIZE {
                f(
                    (l1 * COW_L2_SIZE + l2) as u64,
                    Entry {
                        store: self,
                        base: self.entry_base(l2_block, l2),
                    },
                );
            }
        }
    }

    /// Reads raw bytes from the data file; short reads at the end are
    /// zero-filled and reported.
    pub fn read_data(&self, data_offset: u64, buf: &mut [u8]) -> crate::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.data.read_at(&mut buf[filled..], data_offset + filled as u64)?;
            if n == 0 {
                buf[filled..].fill(0);
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    pub(crate) fn write_data_raw(&self, data_offset: u64, buf: &[u8]) -> crate::Result<()> {
        self.data.write_all_at(buf, data_offset)?;
        Ok(())
    }

    /// Truncates or extends the virtual image.
    pub fn set_size(&self, new_size: u64) -> crate::Result<()> {
        let old_size = self.image_size();

        if new_size > old_size {
            self.zero_blocks(old_size, new_size)?;
        } else if new_size < old_size {
            // Stale local data past the new end must never resurface
            self.zero_blocks(new_size, old_size)?;
        }

        if new_size < self.original_image_size() {
            self.au64(HDR_ORIGINAL_SIZE)
                .store(new_size, Ordering::Release);
        }
        self.au64(HDR_IMAGE_SIZE).store(new_size, Ordering::Release);
        Ok(())
    }

    /// Makes `[from, to)` read as zeros: the partial leading frame gets its
    /// local tail bytes zeroed, every following block has its bit cleared.
    /// Regions with no L2 allocated are already zero by construction.
    fn zero_blocks(&self, from: u64, to: u64) -> crate::Result<()> {
        let mut cursor = from;
        if from % BLOCK_SIZE != 0 {
            if let Some(entry) = self.entry_at(from) {
                let bit = bit_index(from);
                if entry.offset() >= 0 && entry.check_bit(bit) {
                    let in_frame = from % BLOCK_SIZE;
                    let zeros = vec![0u8; (BLOCK_SIZE - in_frame) as usize];
                    let in_entry = from % COW_METADATA_STORAGE_CAPACITY;
                    self.write_data_raw(entry.offset() as u64 + in_entry, &zeros)?;
                }
            }
            cursor = (from / BLOCK_SIZE + 1) * BLOCK_SIZE;
        }
        // Clear whole-block bits entry by entry
        while cursor < to {
            let entry_end =
                (cursor / COW_METADATA_STORAGE_CAPACITY + 1) * COW_METADATA_STORAGE_CAPACITY;
            let run_end = entry_end.min(to);
            if let Some(entry) = self.entry_at(cursor) {
                let first = bit_index(cursor);
                let last = first + ((run_end - cursor).div_ceil(BLOCK_SIZE)) as usize;
                entry.clear_bits(first, last.min(COW_BLOCKS_PER_ENTRY as usize));
            }
            cursor = entry_end;
        }
        Ok(())
    }
}

/// View of one 64-byte metadata entry inside the mapping.
#[derive(Clone, Copy)]
pub struct Entry<'a> {
    store: &'a CowStore,
    base: usize,
}

impl Entry<'_> {
    /// Data-file offset, `-1` while unallocated.
    pub fn offset(&self) -> i64 {
        self.store.ai64(self.base + ENTRY_OFFSET).load(Ordering::Acquire)
    }

    /// Returns the data-file offset, reserving one entry-sized region on
    /// first use. The reservation is logical; the data file stays sparse.
    pub fn ensure_data_offset(&self) -> u64 {
        let current = self.offset();
        if current >= 0 {
            return current as u64;
        }
        let _guard = self.store.l2_create_lock.lock().unwrap();
        let current = self.offset();
        if current >= 0 {
            return current as u64;
        }
        let assigned = self
            .store
            .au64(HDR_DATA_FILE_SIZE)
            .fetch_add(COW_METADATA_STORAGE_CAPACITY, Ordering::AcqRel);
        self.store
            .ai64(self.base + ENTRY_OFFSET)
            .store(assigned as i64, Ordering::Release);
        assigned
    }

    /// Seconds-since-epoch of the last unuploaded change; 0 means clean.
    pub fn time_changed(&self) -> u64 {
        self.store
            .au64(self.base + ENTRY_TIME_CHANGED)
            .load(Ordering::Acquire)
    }

    pub fn mark_changed(&self) {
        self.store
            .au64(self.base + ENTRY_TIME_CHANGED)
            .store(now_secs().max(1), Ordering::Release);
    }

    /// Clears the dirty timestamp only if it still holds the value captured
    /// when the upload started; later writes keep the entry dirty.
    pub fn clear_time_changed_if(&self, captured: u64) -> bool {
        self.store
            .au64(self.base + ENTRY_TIME_CHANGED)
            .compare_exchange(captured, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn uploads(&self) -> u64 {
        self.store.au64(self.base + ENTRY_UPLOADS).load(Ordering::Acquire)
    }

    pub fn count_upload(&self) -> u64 {
        self.store
            .au64(self.base + ENTRY_UPLOADS)
            .fetch_add(1, Ordering::AcqRel)
            + 1
    }

    pub fn check_bit(&self, bit: usize) -> bool {
        let byte = self
            .store
            .au8(self.base + ENTRY_BITFIELD + bit / 8)
            .load(Ordering::Acquire);
        byte >> (bit % 8) & 1 != 0
    }

    /// Sets `[from, to)` bits; atomic per byte.
    pub fn set_bits(&self, from: usize, to: usize) {
        self.apply_bits(from, to, true);
    }

    pub fn clear_bits(&self, from: usize, to: usize) {
        self.apply_bits(from, to, false);
    }

    fn apply_bits(&self, from: usize, to: usize, value: bool) {
        let to = to.min(COW_BLOCKS_PER_ENTRY as usize);
        let mut bit = from;
        while bit < to {
            let byte = bit / 8;
            let lo = bit % 8;
            let hi = ((to - 1).min(byte * 8 + 7)) % 8;
            let mask = ((0xffu16 >> (7 - hi + lo)) as u8) << lo;
            let cell = self.store.au8(self.base + ENTRY_BITFIELD + byte);
            if value {
                cell.fetch_or(mask, Ordering::AcqRel);
            } else {
                cell.fetch_and(!mask, Ordering::AcqRel);
            }
            bit = (byte + 1) * 8;
        }
    }

    pub fn bitfield_snapshot(&self) -> [u8; COW_BITFIELD_SIZE] {
        let mut out = [0u8; COW_BITFIELD_SIZE];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self
                .store
                .au8(self.base + ENTRY_BITFIELD + i)
                .load(Ordering::Acquire);
        }
        out
    }

    /// Writes payload bytes into this entry's data region, flips the
    /// covered bits and stamps the change time.
    pub fn write_payload(&self, in_entry_offset: u64, buf: &[u8]) -> crate::Result<()> {
        let data_offset = self.ensure_data_offset();
        self.store
            .write_data_raw(data_offset + in_entry_offset, buf)?;
        let first = (in_entry_offset / BLOCK_SIZE) as usize;
        let last = ((in_entry_offset + buf.len() as u64 - 1) / BLOCK_SIZE) as usize;
        self.set_bits(first, last + 1);
        self.mark_changed();
        Ok(())
    }

    /// Reads locally present bytes from this entry's data region.
    pub fn read_payload(&self, in_entry_offset: u64, buf: &mut [u8]) -> crate::Result<()> {
        let offset = self.offset();
        debug_assert!(offset >= 0, "read of unallocated entry");
        self.store.read_data(offset as u64 + in_entry_offset, buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(dir: &Path) -> CowStore {
        CowStore::create(dir, "test/image.img", 3, 64 * BLOCK_SIZE).unwrap()
    }

    #[test]
    fn header_layout_matches_offsets() {
        let header = CowMetaHeader {
            magic: COW_META_MAGIC,
            version: COW_FILE_VERSION,
            blocksize: BLOCK_SIZE as u32,
            original_image_size: 0x1111,
            image_size: 0x2222,
            data_file_size: 0x3333,
            creation_time: 1,
            meta_data_start: META_DATA_START,
            next_l2: 0x4444,
            bitfield_size: COW_BITFIELD_SIZE as u32,
            reserved: 0,
            max_image_size: COW_MAX_IMAGE_SIZE,
            uuid: [0u8; UUID_LEN + 1],
            image_name: [0u8; NAME_LEN],
        };
        let mut cursor = Cursor::new(Vec::new());
        header.write(&mut cursor).unwrap();
        let raw = cursor.into_inner();
        assert_eq!(raw.len(), HEADER_SIZE);
        let at = |off: usize| u64::from_le_bytes(raw[off..off + 8].try_into().unwrap());
        assert_eq!(at(HDR_ORIGINAL_SIZE), 0x1111);
        assert_eq!(at(HDR_IMAGE_SIZE), 0x2222);
        assert_eq!(at(HDR_DATA_FILE_SIZE), 0x3333);
        assert_eq!(at(HDR_NEXT_L2), 0x4444);
    }

    #[test]
    fn create_then_load() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = fresh(dir.path());
            store.set_uuid("0f0e0d0c-0b0a-0908-0706-050403020100");
            store.entry_for_write(0).write_payload(0, &[7u8; 4096]).unwrap();
        }
        let store = CowStore::load(dir.path()).unwrap();
        assert_eq!(store.image_name(), "test/image.img");
        assert_eq!(store.uuid(), "0f0e0d0c-0b0a-0908-0706-050403020100");
        assert_eq!(store.image_size(), 64 * BLOCK_SIZE);
        let entry = store.entry_at(0).unwrap();
        assert!(entry.check_bit(0));
        let mut buf = [0u8; 8];
        entry.read_payload(0, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 8]);
    }

    #[test]
    fn byteswapped_magic_is_wrong_endianness() {
        let dir = tempfile::tempdir().unwrap();
        drop(fresh(dir.path()));
        let meta = dir.path().join("meta");
        let mut raw = std::fs::read(&meta).unwrap();
        raw[..8].reverse();
        std::fs::write(&meta, raw).unwrap();
        assert!(matches!(
            CowStore::load(dir.path()),
            Err(CowError::WrongEndianness)
        ));
    }

    #[test]
    fn unknown_magic_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        drop(fresh(dir.path()));
        let meta = dir.path().join("meta");
        let mut raw = std::fs::read(&meta).unwrap();
        raw[0] ^= 0x55;
        raw[3] ^= 0x55;
        std::fs::write(&meta, raw).unwrap();
        assert!(matches!(
            CowStore::load(dir.path()),
            Err(CowError::MetaFormat(_))
        ));
    }

    #[test]
    fn l2_allocation_is_lazy_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh(dir.path());
        assert!(store.l1_entry(0).is_none());
        let first = store.ensure_l2(0);
        let again = store.ensure_l2(0);
        assert_eq!(first, again);
        let second = store.ensure_l2(1);
        assert_ne!(first, second);
    }

    #[test]
    fn data_offsets_are_assigned_once_and_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh(dir.path());
        let a = store.entry_for_write(0);
        let b = store.entry_for_write(COW_METADATA_STORAGE_CAPACITY);
        let off_a = a.ensure_data_offset();
        let off_b = b.ensure_data_offset();
        assert_eq!(off_a, COW_METADATA_STORAGE_CAPACITY);
        assert_eq!(off_b, 2 * COW_METADATA_STORAGE_CAPACITY);
        assert_eq!(a.ensure_data_offset(), off_a);
        assert_eq!(store.data_file_size(), 3 * COW_METADATA_STORAGE_CAPACITY);
    }

    #[test]
    fn dirty_timestamp_cas() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh(dir.path());
        let entry = store.entry_for_write(0);
        entry.write_payload(0, &[1u8; 10]).unwrap();
        let captured = entry.time_changed();
        assert_ne!(captured, 0);
        assert!(entry.clear_time_changed_if(captured));
        assert_eq!(entry.time_changed(), 0);

        entry.write_payload(0, &[2u8; 10]).unwrap();
        let stale = 12345;
        assert!(!entry.clear_time_changed_if(stale));
        assert_ne!(entry.time_changed(), 0);
    }

    #[test]
    fn truncate_below_original_zeroes_reads() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh(dir.path());
        let entry = store.entry_for_write(0);
        entry.write_payload(0, &[9u8; 8192]).unwrap();
        assert!(entry.check_bit(1));

        store.set_size(BLOCK_SIZE).unwrap();
        assert_eq!(store.image_size(), BLOCK_SIZE);
        assert_eq!(store.original_image_size(), BLOCK_SIZE);
        let entry = store.entry_at(0).unwrap();
        assert!(entry.check_bit(0));
        assert!(!entry.check_bit(1));
    }

    #[test]
    fn grow_clears_stale_bits() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh(dir.path());
        let entry = store.entry_for_write(0);
        entry.write_payload(0, &[9u8; 4 * 4096]).unwrap();
        store.set_size(BLOCK_SIZE).unwrap();
        store.set_size(4 * BLOCK_SIZE).unwrap();
        let entry = store.entry_at(0).unwrap();
        assert!(entry.check_bit(0));
        assert!(!entry.check_bit(1));
        assert!(!entry.check_bit(3));
    }
}

//! Read/write semantics of the CoW overlay.
//!
//! Reads are served per 4 KiB block from the local data file, as zeros for
//! sparse extension past the origin, or from the origin itself; adjacent
//! blocks with the same source coalesce into one I/O. Writes that touch
//! partial frames whose block is not yet local are padded by fetching the
//! frame from the origin, merging, and storing the full frame. Padding
//! runs as concurrent sub-requests; the reply to the caller materializes
//! only when all of them have landed.

use std::sync::Arc;

use futures::future::try_join_all;

use crate::store::CowStore;
use crate::{CowError, BLOCK_SIZE, COW_METADATA_STORAGE_CAPACITY};

/// Access to the origin image over the existing network connection.
pub trait OriginReader: Send + Sync {
    fn read_at(
        &self,
        offset: u64,
        len: u32,
    ) -> impl std::future::Future<Output = std::io::Result<Vec<u8>>> + Send;
}

/// The mapped image: CoW store in front of an origin.
pub struct CowFile<R: OriginReader> {
    store: Arc<CowStore>,
    origin: R,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Local,
    Zero,
    Remote,
}

impl<R: OriginReader> CowFile<R> {
    pub fn new(store: Arc<CowStore>, origin: R) -> Self {
        Self { store, origin }
    }

    pub fn store(&self) -> &Arc<CowStore> {
        &self.store
    }

    fn classify(&self, offset: u64) -> Source {
        if let Some(entry) = self.store.entry_at(offset) {
            if entry.check_bit(crate::bit_index(offset)) {
                return Source::Local;
            }
        }
        if offset >= self.store.original_image_size() {
            Source::Zero
        } else {
            Source::Remote
        }
    }

    /// Reads up to `size` bytes at `offset`; shorter at end of image.
    pub async fn read(&self, offset: u64, size: u32) -> crate::Result<Vec<u8>> {
        let image_size = self.store.image_size();
        if offset >= image_size {
            return Ok(Vec::new());
        }
        let end = (offset + size as u64).min(image_size);
        let mut out = vec![0u8; (end - offset) as usize];

        let mut remote_runs: Vec<(u64, usize, usize)> = Vec::new();
        let mut cursor = offset;
        while cursor < end {
            let source = self.classify(cursor);
            let mut run_end = (cursor / BLOCK_SIZE + 1) * BLOCK_SIZE;
            loop {
                if run_end >= end || self.classify(run_end) != source {
                    break;
                }
                // Local runs stop at entry borders; the data file is only
                // contiguous within one entry
                if source == Source::Local && run_end % COW_METADATA_STORAGE_CAPACITY == 0 {
                    break;
                }
                run_end += BLOCK_SIZE;
            }
            let run_end = run_end.min(end);
            let dest = (cursor - offset) as usize;
            let len = (run_end - cursor) as usize;
            match source {
                Source::Local => {
                    let entry = self.store.entry_at(cursor).ok_or_else(|| {
                        CowError::DataFormat("present bit without an index entry".into())
                    })?;
                    entry.read_payload(
                        cursor % COW_METADATA_STORAGE_CAPACITY,
                        &mut out[dest..dest + len],
                    )?;
                }
                Source::Zero => {}
                Source::Remote => remote_runs.push((cursor, len, dest)),
            }
            cursor = run_end;
        }

        if !remote_runs.is_empty() {
            let original = self.store.original_image_size();
            let fetched = try_join_all(remote_runs.iter().map(|&(start, len, _)| {
                // The origin cannot serve past its own end; the tail of a
                // straddling run stays zero
                let fetch_len = (original - start).min(len as u64) as u32;
                self.origin.read_at(start, fetch_len)
            }))
            .await
            .map_err(CowError::Origin)?;
            for ((_, len, dest), data) in remote_runs.iter().zip(fetched) {
                let n = data.len().min(*len);
                out[*dest..dest + n].copy_from_slice(&data[..n]);
            }
        }
        Ok(out)
    }

    /// Writes `buf` at `offset`, extending the image when needed.
    pub async fn write(&self, offset: u64, buf: &[u8]) -> crate::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let image_size = self.store.image_size();
        // Fill any gap between the current end and the write with zeros;
        // the partial frame at the write's start is covered by its own
        // head padding
        if offset > image_size {
            let gap_end = offset & !(BLOCK_SIZE - 1);
            let mut cursor = image_size;
            let zeros = vec![0u8; 64 * 1024];
            while cursor < gap_end {
                let n = zeros.len().min((gap_end - cursor) as usize);
                self.write_span(cursor, &zeros[..n]).await?;
                cursor += n as u64;
            }
        }
        self.write_span(offset, buf).await?;
        self.store.grow_image_size(offset + buf.len() as u64);
        Ok(())
    }

    async fn write_span(&self, offset: u64, buf: &[u8]) -> crate::Result<()> {
        let end = offset + buf.len() as u64;
        // Frames needing read-modify-write: (frame start, absolute payload
        // start, index into buf, payload length)
        let mut pads: Vec<(u64, u64, usize, usize)> = Vec::new();

        let mut cursor = offset;
        while cursor < end {
            let entry = self.store.entry_for_write(cursor);
            let in_entry = cursor % COW_METADATA_STORAGE_CAPACITY;
            let mut chunk = ((end - cursor) as usize)
                .min((COW_METADATA_STORAGE_CAPACITY - in_entry) as usize);

            // Unaligned head on a block that is not yet local: defer to a
            // padded full-frame write
            if cursor % BLOCK_SIZE != 0 && !entry.check_bit(crate::bit_index(cursor)) {
                let pad = chunk.min((BLOCK_SIZE - cursor % BLOCK_SIZE) as usize);
                pads.push((
                    cursor & !(BLOCK_SIZE - 1),
                    cursor,
                    (cursor - offset) as usize,
                    pad,
                ));
                cursor += pad as u64;
                continue;
            }

            // Unaligned tail into a block that is not yet local
            let chunk_end = cursor + chunk as u64;
            if chunk_end % BLOCK_SIZE != 0 {
                let tail_frame = chunk_end & !(BLOCK_SIZE - 1);
                if tail_frame >= cursor && !entry.check_bit(crate::bit_index(tail_frame)) {
                    let tail_len = (chunk_end - tail_frame) as usize;
                    pads.push((
                        tail_frame,
                        tail_frame,
                        (tail_frame - offset) as usize,
                        tail_len,
                    ));
                    chunk -= tail_len;
                }
            }

            if chunk > 0 {
                let src = (cursor - offset) as usize;
                entry.write_payload(in_entry, &buf[src..src + chunk])?;
            }
            cursor += chunk as u64;
        }

        try_join_all(pads.iter().map(|&(frame, abs, src, len)| {
            self.pad_frame(frame, (abs - frame) as usize, &buf[src..src + len])
        }))
        .await?;
        Ok(())
    }

    /// Builds one full 4 KiB frame around `payload` (placed at `in_frame`),
    /// reading the missing bytes from the origin when the frame lies inside
    /// the original image and zero-filling otherwise, then stores the
    /// frame.
    async fn pad_frame(
        &self,
        frame_start: u64,
        in_frame: usize,
        payload: &[u8],
    ) -> crate::Result<()> {
        let original = self.store.original_image_size();
        let mut frame = vec![0u8; BLOCK_SIZE as usize];
        if frame_start < original {
            let fetch = (original - frame_start).min(BLOCK_SIZE) as u32;
            let data = self
                .origin
                .read_at(frame_start, fetch)
                .await
                .map_err(CowError::Origin)?;
            let n = data.len().min(frame.len());
            frame[..n].copy_from_slice(&data[..n]);
        }
        frame[in_frame..in_frame + payload.len()].copy_from_slice(payload);

        let entry = self.store.entry_for_write(frame_start);
        entry.write_payload(frame_start % COW_METADATA_STORAGE_CAPACITY, &frame)?;
        Ok(())
    }

    /// Truncates or extends the mapped image.
    pub fn set_size(&self, new_size: u64) -> crate::Result<()> {
        self.store.set_size(new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MemOrigin {
        data: Vec<u8>,
        reads: AtomicUsize,
    }

    impl MemOrigin {
        fn patterned(len: usize) -> Self {
            Self {
                data: (0..len).map(|i| (i % 251) as u8).collect(),
                reads: AtomicUsize::new(0),
            }
        }
    }

    impl OriginReader for &MemOrigin {
        async fn read_at(&self, offset: u64, len: u32) -> std::io::Result<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            let start = offset as usize;
            let end = (start + len as usize).min(self.data.len());
            if start > self.data.len() {
                return Err(std::io::ErrorKind::UnexpectedEof.into());
            }
            Ok(self.data[start..end].to_vec())
        }
    }

    const MIB: u64 = 1024 * 1024;

    fn rig(dir: &std::path::Path, origin_len: u64) -> (Arc<CowStore>, MemOrigin) {
        let store = Arc::new(CowStore::create(dir, "rig.img", 1, origin_len).unwrap());
        (store, MemOrigin::patterned(origin_len as usize))
    }

    #[tokio::test]
    async fn write_then_read_returns_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, origin) = rig(dir.path(), MIB);
        let file = CowFile::new(store, &origin);

        let payload: Vec<u8> = (0..8192u32).map(|i| (i % 7) as u8).collect();
        file.write(12288, &payload).await.unwrap();
        assert_eq!(file.read(12288, 8192).await.unwrap(), payload);
        // Aligned write needs no origin round trip
        assert_eq!(origin.reads.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn unallocated_read_below_original_comes_from_origin() {
        let dir = tempfile::tempdir().unwrap();
        let (store, origin) = rig(dir.path(), MIB);
        let file = CowFile::new(store, &origin);

        let got = file.read(4096, 12288).await.unwrap();
        assert_eq!(got, origin.data[4096..4096 + 12288].to_vec());
        // Three adjacent remote blocks coalesce into one origin read
        assert_eq!(origin.reads.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn read_past_original_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (store, origin) = rig(dir.path(), MIB);
        store.set_size(2 * MIB).unwrap();
        let file = CowFile::new(store, &origin);

        let got = file.read(MIB, 4096).await.unwrap();
        assert_eq!(got, vec![0u8; 4096]);
        assert_eq!(origin.reads.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn unaligned_write_pads_from_origin() {
        let dir = tempfile::tempdir().unwrap();
        let (store, origin) = rig(dir.path(), MIB);
        let file = CowFile::new(store.clone(), &origin);

        file.write(1234, &[0x5a]).await.unwrap();
        assert_eq!(origin.reads.load(Ordering::Relaxed), 1);

        // Exactly the first block went dirty
        let entry = store.entry_at(0).unwrap();
        assert!(entry.check_bit(0));
        assert!(!entry.check_bit(1));

        // The stored frame is origin data with our byte patched in
        let frame = file.read(0, 4096).await.unwrap();
        assert_eq!(frame[1234], 0x5a);
        assert_eq!(frame[..1234], origin.data[..1234]);
        assert_eq!(frame[1235..4096], origin.data[1235..4096]);
    }

    #[tokio::test]
    async fn one_byte_write_at_last_origin_byte_rmws_the_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (store, origin) = rig(dir.path(), MIB);
        let file = CowFile::new(store.clone(), &origin);

        file.write(MIB - 1, &[0xee]).await.unwrap();
        let entry = store.entry_at(MIB - 1).unwrap();
        assert!(entry.check_bit(crate::bit_index(MIB - 1)));

        let frame = file.read(MIB - 4096, 4096).await.unwrap();
        assert_eq!(frame[4095], 0xee);
        assert_eq!(frame[..4095], origin.data[MIB as usize - 4096..MIB as usize - 1]);
    }

    #[tokio::test]
    async fn writes_past_the_end_extend_with_zero_fill() {
        let dir = tempfile::tempdir().unwrap();
        let (store, origin) = rig(dir.path(), MIB);
        let file = CowFile::new(store.clone(), &origin);

        file.write(MIB + 10000, &[0x42; 16]).await.unwrap();
        assert_eq!(store.image_size(), MIB + 10016);

        // The gap reads as zeros, the payload comes back, no origin I/O
        let gap = file.read(MIB, 10000).await.unwrap();
        assert!(gap.iter().all(|&b| b == 0));
        assert_eq!(file.read(MIB + 10000, 16).await.unwrap(), vec![0x42; 16]);
        assert_eq!(origin.reads.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn mixed_read_stitches_all_three_sources() {
        let dir = tempfile::tempdir().unwrap();
        let (store, origin) = rig(dir.path(), MIB);
        store.set_size(MIB + 8192).unwrap();
        let file = CowFile::new(store, &origin);

        file.write(8192, &[9u8; 4096]).await.unwrap();

        // [4096..8192) remote, [8192..12288) local, tail beyond original zero
        let got = file.read(4096, (MIB - 4096 + 8192) as u32).await.unwrap();
        assert_eq!(got[..4096], origin.data[4096..8192]);
        assert_eq!(got[4096..8192], [9u8; 4096]);
        assert_eq!(
            got[8192..(MIB - 4096) as usize],
            origin.data[12288..MIB as usize]
        );
        assert!(got[(MIB - 4096) as usize..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn truncate_below_original_then_read_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let (store, origin) = rig(dir.path(), MIB);
        let file = CowFile::new(store.clone(), &origin);
        file.write(0, &[1u8; 8192]).await.unwrap();

        file.set_size(4096).unwrap();
        store.grow_image_size(MIB); // make the range readable again
        let got = file.read(4096, 8192).await.unwrap();
        assert_eq!(got, vec![0u8; 8192]);
    }
}

//! CRC integrity sidecars and the background verification worker.
//!
//! A `.crc` sidecar stores a u32 master checksum followed by one CRC32 per
//! 16 MiB chunk of the virtual image size. The master is CRC32 over the
//! list itself. Chunks failing verification get their cache-map bits
//! reverted so the data is refetched.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use blockfab_proto::{align_up, BLOCK_SIZE, HASH_BLOCK_SIZE};

use crate::image::Image;
use crate::ServerError;

/// Per-image checksum list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrcList {
    master: u32,
    crcs: Vec<u32>,
}

/// Number of 16 MiB chunks covering a virtual size.
pub fn chunk_count(virtual_size: u64) -> u64 {
    virtual_size.div_ceil(HASH_BLOCK_SIZE)
}

impl CrcList {
    /// Loads a sidecar; `Ok(None)` when the file does not exist.
    pub fn load(path: &Path, virtual_size: u64) -> crate::Result<Option<CrcList>> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let expected = 4 + 4 * chunk_count(virtual_size) as usize;
        if raw.len() != expected {
            return Err(ServerError::CrcFile(format!(
                "{}: {} bytes, expected {expected}",
                path.display(),
                raw.len()
            )));
        }
        let master = u32::from_le_bytes(raw[..4].try_into().unwrap());
        let crcs = raw[4..]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Ok(Some(CrcList { master, crcs }))
    }

    /// Checks the master checksum against the list.
    pub fn verify_master(&self) -> bool {
        self.master == master_of(&self.crcs)
    }

    pub fn chunk_crc(&self, chunk: u64) -> Option<u32> {
        self.crcs.get(chunk as usize).copied()
    }

    pub fn chunks(&self) -> u64 {
        self.crcs.len() as u64
    }

    /// Hashes one image chunk and compares it against the list.
    pub fn verify_chunk(&self, image: &Image, chunk: u64) -> crate::Result<bool> {
        let Some(expected) = self.chunk_crc(chunk) else {
            return Ok(false);
        };
        let start = chunk * HASH_BLOCK_SIZE;
        let end = (start + HASH_BLOCK_SIZE).min(image.virtual_size());
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; 1 << 20];
        let mut offset = start;
        while offset < end {
            let n = buf.len().min((end - offset) as usize);
            image.read_at(&mut buf[..n], offset)?;
            hasher.update(&buf[..n]);
            offset += n as u64;
        }
        Ok(hasher.finalize() == expected)
    }

    /// Computes a fresh list for an arbitrary image file. The trailing
    /// partial chunk is hashed zero-padded to the virtual size.
    pub fn generate(path: &Path) -> crate::Result<CrcList> {
        let file = File::open(path)?;
        let real_size = file.metadata()?.len();
        let virtual_size = align_up(real_size);
        let mut crcs = Vec::with_capacity(chunk_count(virtual_size) as usize);
        let mut buf = vec![0u8; 1 << 20];
        for chunk in 0..chunk_count(virtual_size) {
            let start = chunk * HASH_BLOCK_SIZE;
            let end = (start + HASH_BLOCK_SIZE).min(virtual_size);
            let mut hasher = crc32fast::Hasher::new();
            let mut offset = start;
            while offset < end {
                let n = buf.len().min((end - offset) as usize);
                read_zero_padded(&file, &mut buf[..n], offset, real_size)?;
                hasher.update(&buf[..n]);
                offset += n as u64;
            }
            crcs.push(hasher.finalize());
        }
        Ok(CrcList {
            master: master_of(&crcs),
            crcs,
        })
    }

    /// Writes the sidecar next to the image file.
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let mut raw = Vec::with_capacity(4 + 4 * self.crcs.len());
        raw.extend_from_slice(&self.master.to_le_bytes());
        for crc in &self.crcs {
            raw.extend_from_slice(&crc.to_le_bytes());
        }
        std::fs::write(path, raw)?;
        Ok(())
    }
}

fn master_of(crcs: &[u32]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for crc in crcs {
        hasher.update(&crc.to_le_bytes());
    }
    hasher.finalize()
}

fn read_zero_padded(
    file: &File,
    buf: &mut [u8],
    offset: u64,
    real_size: u64,
) -> std::io::Result<()> {
    if offset >= real_size {
        buf.fill(0);
        return Ok(());
    }
    let readable = ((real_size - offset) as usize).min(buf.len());
    file.read_exact_at(&mut buf[..readable], offset)?;
    buf[readable..].fill(0);
    Ok(())
}

/// Background verification worker. Uplinks queue `(image, chunk)` pairs
/// after completing a 16 MiB chunk; mismatches revert the chunk's
/// cache-map bits.
pub struct IntegrityChecker {
    tx: mpsc::UnboundedSender<(Arc<Image>, u64)>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IntegrityChecker {
    pub fn spawn() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Arc<Image>, u64)>();
        let worker = tokio::spawn(async move {
            while let Some((image, chunk)) = rx.recv().await {
                let result = tokio::task::spawn_blocking(move || {
                    let ok = match image.crc() {
                        Some(crc) => crc.verify_chunk(&image, chunk),
                        None => return,
                    };
                    match ok {
                        Ok(true) => {
                            debug!("chunk {chunk} of {} verified", image.name());
                        }
                        Ok(false) => {
                            error!(
                                "chunk {chunk} of {}:{} failed crc check, reverting",
                                image.name(),
                                image.rid()
                            );
                            let first = chunk * HASH_BLOCK_SIZE / BLOCK_SIZE;
                            let end = (first + HASH_BLOCK_SIZE / BLOCK_SIZE)
                                .min(image.virtual_size().div_ceil(BLOCK_SIZE));
                            image.invalidate_blocks(first, end);
                        }
                        Err(e) => error!("chunk verification failed to run: {e}"),
                    }
                })
                .await;
                if result.is_err() {
                    error!("integrity worker panicked on a chunk");
                }
            }
            info!("integrity checker drained");
        });
        Arc::new(Self {
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn queue(&self, image: Arc<Image>, chunk: u64) {
        let _ = self.tx.send((image, chunk));
    }

    /// Stops accepting work and lets the queue drain.
    pub fn shutdown(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_save_load_verify() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("x.r1");
        std::fs::write(&img, vec![0x5a; 3 * 4096 + 17]).unwrap();

        let list = CrcList::generate(&img).unwrap();
        assert!(list.verify_master());
        assert_eq!(list.chunks(), 1);

        let crc_path = dir.path().join("x.r1.crc");
        list.save(&crc_path).unwrap();
        let loaded = CrcList::load(&crc_path, align_up(3 * 4096 + 17))
            .unwrap()
            .unwrap();
        assert_eq!(loaded, list);
        assert!(loaded.verify_master());
    }

    #[test]
    fn corrupted_master_is_detected() {
        let crcs = vec![1u32, 2, 3];
        let list = CrcList {
            master: master_of(&crcs) ^ 1,
            crcs,
        };
        assert!(!list.verify_master());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let crc_path = dir.path().join("bad.crc");
        std::fs::write(&crc_path, [0u8; 7]).unwrap();
        assert!(matches!(
            CrcList::load(&crc_path, 4096),
            Err(ServerError::CrcFile(_))
        ));
    }

    #[test]
    fn missing_sidecar_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CrcList::load(&dir.path().join("none.crc"), 4096)
            .unwrap()
            .is_none());
    }

    #[test]
    fn chunk_verification_detects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let img_path = dir.path().join("v.r1");
        std::fs::write(&img_path, vec![0x11; 2 * 4096]).unwrap();
        let list = CrcList::generate(&img_path).unwrap();

        let image = Image::open(&img_path, "v", 1).unwrap();
        assert!(list.verify_chunk(&image, 0).unwrap());

        // Flip one byte on disk
        let f = std::fs::OpenOptions::new()
            .write(true)
            .open(&img_path)
            .unwrap();
        f.write_all_at(&[0x12], 100).unwrap();
        assert!(!list.verify_chunk(&image, 0).unwrap());
    }
}

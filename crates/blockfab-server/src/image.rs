//! Image records and the process-wide registry.
//!
//! An image is identified by `(name, rid)` and backed by a file named
//! `<name>.r<rid>` under the base path. A `.map` sidecar marks a partially
//! cached (proxied) image; its absence means the image is complete. A
//! `.crc` sidecar carries the integrity checksums.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use blockfab_proto::bitmap::{self, BlockBitmap};
use blockfab_proto::{align_up, BLOCK_SIZE};

use crate::integrity::CrcList;
use crate::uplink::Uplink;
use crate::ServerError;

/// Completeness estimates are refreshed at most this often.
const COMPLETENESS_ESTIMATE_INTERVAL: Duration = Duration::from_secs(4);

/// One exported image revision.
pub struct Image {
    name: String,
    rid: u16,
    path: PathBuf,
    virtual_size: u64,
    real_size: u64,
    file: File,
    map_file: RwLock<Option<File>>,
    cache_map: RwLock<Option<Arc<BlockBitmap>>>,
    crc: Option<CrcList>,
    working: AtomicBool,
    completeness: AtomicU8,
    next_estimate: Mutex<Instant>,
    users: AtomicU32,
    uplink: Mutex<Weak<Uplink>>,
}

impl Image {
    /// Opens an existing image file plus whatever sidecars exist.
    pub fn open(path: &Path, name: &str, rid: u16) -> crate::Result<Arc<Image>> {
        // Cache writes need a writable fd; a complete image on a read-only
        // volume is still exportable
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(_) => OpenOptions::new().read(true).open(path)?,
        };
        let real_size = file.metadata()?.len();
        let virtual_size = align_up(real_size);

        let map_path = sidecar(path, "map");
        let (map_file, cache_map) = match OpenOptions::new().read(true).write(true).open(&map_path)
        {
            Ok(f) => {
                let mut raw = vec![0u8; bitmap::byte_len(bitmap::block_count(virtual_size))];
                f.read_exact_at(&mut raw, 0).map_err(|e| {
                    ServerError::protocol(format!("cache map {} unreadable: {e}", map_path.display()))
                })?;
                let map = BlockBitmap::from_bytes(&raw, bitmap::block_count(virtual_size))
                    .ok_or_else(|| {
                        ServerError::protocol(format!(
                            "cache map {} has the wrong size",
                            map_path.display()
                        ))
                    })?;
                (Some(f), Some(Arc::new(map)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (None, None),
            Err(e) => return Err(e.into()),
        };

        let mut working = true;
        let crc = match CrcList::load(&sidecar(path, "crc"), virtual_size) {
            Ok(Some(crc)) => {
                if !crc.verify_master() {
                    error!("{name}:{rid}: crc master mismatch, marking not working");
                    working = false;
                }
                Some(crc)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("{name}:{rid}: unusable crc sidecar: {e}");
                None
            }
        };

        let image = Arc::new(Image {
            name: name.to_string(),
            rid,
            path: path.to_path_buf(),
            virtual_size,
            real_size,
            file,
            map_file: RwLock::new(map_file),
            cache_map: RwLock::new(cache_map),
            crc,
            working: AtomicBool::new(working),
            completeness: AtomicU8::new(0),
            next_estimate: Mutex::new(Instant::now()),
            users: AtomicU32::new(0),
            uplink: Mutex::new(Weak::new()),
        });
        image.refresh_completeness(true);
        Ok(image)
    }

    /// Creates an empty local file with an all-zero cache map, either
    /// preallocated or hole-punched depending on `sparse`.
    pub fn create(
        path: &Path,
        name: &str,
        rid: u16,
        size: u64,
        sparse: bool,
    ) -> crate::Result<Arc<Image>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let virtual_size = align_up(size);
        if sparse {
            file.set_len(virtual_size)?;
        } else {
            let zeros = vec![0u8; (1 << 20).min(virtual_size as usize).max(1)];
            let mut written = 0u64;
            while written < virtual_size {
                let n = zeros.len().min((virtual_size - written) as usize);
                file.write_all_at(&zeros[..n], written)?;
                written += n as u64;
            }
        }

        let map_path = sidecar(path, "map");
        let map_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&map_path)?;
        let map = BlockBitmap::new(bitmap::block_count(virtual_size));
        map_file.write_all_at(&map.snapshot(), 0)?;

        info!("created image {name}:{rid} ({size} bytes, sparse={sparse})");
        Ok(Arc::new(Image {
            name: name.to_string(),
            rid,
            path: path.to_path_buf(),
            virtual_size,
            real_size: size,
            file,
            map_file: RwLock::new(Some(map_file)),
            cache_map: RwLock::new(Some(Arc::new(map))),
            crc: None,
            working: AtomicBool::new(true),
            completeness: AtomicU8::new(0),
            next_estimate: Mutex::new(Instant::now()),
            users: AtomicU32::new(0),
            uplink: Mutex::new(Weak::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rid(&self) -> u16 {
        self.rid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    pub fn real_size(&self) -> u64 {
        self.real_size
    }

    pub fn crc(&self) -> Option<&CrcList> {
        self.crc.as_ref()
    }

    pub fn working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    /// Working only ever flips true → false within one lifecycle.
    pub fn mark_not_working(&self) {
        if self.working.swap(false, Ordering::AcqRel) {
            warn!("image {}:{} marked not working", self.name, self.rid);
        }
    }

    /// None means every block is present.
    pub fn cache_map(&self) -> Option<Arc<BlockBitmap>> {
        self.cache_map.read().unwrap().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.cache_map.read().unwrap().is_none()
    }

    pub fn acquire_user(&self) {
        self.users.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release_user(&self) {
        self.users.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn user_count(&self) -> u32 {
        self.users.load(Ordering::Acquire)
    }

    pub fn uplink(&self) -> Option<Arc<Uplink>> {
        self.uplink.lock().unwrap().upgrade()
    }

    /// Publishes the uplink back-reference. The image does not own its
    /// uplink; the uplink owns the image.
    pub fn set_uplink(&self, uplink: &Arc<Uplink>) {
        *self.uplink.lock().unwrap() = Arc::downgrade(uplink);
    }

    pub fn clear_uplink(&self) {
        *self.uplink.lock().unwrap() = Weak::new();
    }

    /// Returns the live uplink or atomically installs a fresh one, so two
    /// racing sessions never spawn twin upstream connections.
    pub fn uplink_or_insert(&self, make: impl FnOnce() -> Arc<Uplink>) -> Arc<Uplink> {
        let mut guard = self.uplink.lock().unwrap();
        if let Some(existing) = guard.upgrade() {
            if !existing.is_shut_down() {
                return existing;
            }
        }
        let fresh = make();
        *guard = Arc::downgrade(&fresh);
        fresh
    }

    /// Reads image bytes; the caller guarantees the range is cached (or the
    /// image complete). Short reads past the real size are zero-filled up
    /// to the virtual size.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> crate::Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.virtual_size {
            return Err(ServerError::protocol("read past virtual size"));
        }
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                // Sparse or short tail: virtual bytes past EOF read as zero
                buf[filled..].fill(0);
                break;
            }
            filled += n;
        }
        Ok(())
    }

    /// Writes upstream payload into the cache file and flips the covered
    /// cache-map bits. A disk error leaves the bits clear so the range is
    /// refetched.
    pub fn write_cache(&self, offset: u64, data: &[u8]) -> crate::Result<()> {
        self.file.write_all_at(data, offset)?;
        let first = offset / BLOCK_SIZE;
        let end = (offset + data.len() as u64).div_ceil(BLOCK_SIZE);
        self.set_cached_range(first, end)?;
        Ok(())
    }

    fn set_cached_range(&self, first_block: u64, end_block: u64) -> crate::Result<()> {
        let Some(map) = self.cache_map() else {
            return Ok(());
        };
        map.set_range(first_block, end_block);

        // Persist the touched map bytes
        if let Some(map_file) = self.map_file.read().unwrap().as_ref() {
            let snapshot = map.snapshot();
            let first_byte = (first_block / 8) as usize;
            let end_byte = (end_block.div_ceil(8) as usize).min(snapshot.len());
            map_file.write_all_at(&snapshot[first_byte..end_byte], first_byte as u64)?;
        }

        if map.is_complete() {
            self.flip_complete();
        }
        Ok(())
    }

    /// Drops the cache map once every block is present; the map file is
    /// removed so the next load sees a complete image.
    fn flip_complete(&self) {
        let mut guard = self.cache_map.write().unwrap();
        if guard.take().is_some() {
            info!("image {}:{} is now complete", self.name, self.rid);
            *self.map_file.write().unwrap() = None;
            if let Err(e) = std::fs::remove_file(sidecar(&self.path, "map")) {
                warn!("could not remove cache map for {}: {e}", self.name);
            }
            self.completeness.store(100, Ordering::Release);
        }
    }

    /// Reverts a chunk's cache-map bits after failed integrity
    /// verification.
    pub fn invalidate_blocks(&self, first_block: u64, end_block: u64) {
        if let Some(map) = self.cache_map() {
            map.clear_range(first_block, end_block);
            if let Some(map_file) = self.map_file.read().unwrap().as_ref() {
                let snapshot = map.snapshot();
                let first_byte = (first_block / 8) as usize;
                let end_byte = (end_block.div_ceil(8) as usize).min(snapshot.len());
                let _ = map_file.write_all_at(&snapshot[first_byte..end_byte], first_byte as u64);
            }
        }
    }

    /// Cached completeness percentage, refreshed at a bounded rate.
    pub fn completeness_percent(&self) -> u8 {
        self.refresh_completeness(false);
        self.completeness.load(Ordering::Acquire)
    }

    fn refresh_completeness(&self, force: bool) {
        let mut next = self.next_estimate.lock().unwrap();
        if !force && Instant::now() < *next {
            return;
        }
        *next = Instant::now() + COMPLETENESS_ESTIMATE_INTERVAL;
        let percent = match self.cache_map() {
            Some(map) => map.completeness_percent(),
            None => 100,
        };
        self.completeness.store(percent, Ordering::Release);
    }
}

fn sidecar(path: &Path, ext: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

/// Splits `foo/bar.r7` into `("foo/bar", 7)`.
fn parse_image_file(relative: &Path) -> Option<(String, u16)> {
    let s = relative.to_str()?;
    let (name, rev) = s.rsplit_once(".r")?;
    let rid: u16 = rev.parse().ok()?;
    if name.is_empty() || rid == 0 {
        return None;
    }
    Some((name.to_string(), rid))
}

/// Process-wide table of images, keyed by `(name, rid)`.
pub struct ImageRegistry {
    base_path: PathBuf,
    max_images: usize,
    images: RwLock<Vec<Arc<Image>>>,
    create_lock: Mutex<()>,
}

impl ImageRegistry {
    pub fn new(base_path: PathBuf, max_images: usize) -> Self {
        Self {
            base_path,
            max_images,
            images: RwLock::new(Vec::new()),
            create_lock: Mutex::new(()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Walks the base path and registers every image found. Already-known
    /// revisions are kept as-is.
    pub fn load_all(&self) -> crate::Result<usize> {
        let mut found = 0;
        let mut stack = vec![self.base_path.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) => {
                    warn!("cannot scan {}: {e}", dir.display());
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.base_path) else {
                    continue;
                };
                let Some((name, rid)) = parse_image_file(relative) else {
                    continue;
                };
                if self.get_exact(&name, rid).is_some() {
                    continue;
                }
                match Image::open(&path, &name, rid) {
                    Ok(image) => {
                        if self.insert(image).is_ok() {
                            found += 1;
                        }
                    }
                    Err(e) => warn!("skipping {}: {e}", path.display()),
                }
            }
        }
        info!("loaded {found} image(s) from {}", self.base_path.display());
        Ok(found)
    }

    pub fn insert(&self, image: Arc<Image>) -> crate::Result<Arc<Image>> {
        let mut images = self.images.write().unwrap();
        if images.len() >= self.max_images {
            return Err(ServerError::TooManyImages(self.max_images));
        }
        if let Some(existing) = images
            .iter()
            .find(|i| i.name() == image.name() && i.rid() == image.rid())
        {
            return Ok(existing.clone());
        }
        images.push(image.clone());
        Ok(image)
    }

    fn get_exact(&self, name: &str, rid: u16) -> Option<Arc<Image>> {
        self.images
            .read()
            .unwrap()
            .iter()
            .find(|i| i.name() == name && i.rid() == rid)
            .cloned()
    }

    /// Resolves `(name, rid)`; rid 0 selects the newest revision.
    pub fn get(&self, name: &str, rid: u16) -> Option<Arc<Image>> {
        if rid != 0 {
            return self.get_exact(name, rid);
        }
        self.images
            .read()
            .unwrap()
            .iter()
            .filter(|i| i.name() == name)
            .max_by_key(|i| i.rid())
            .cloned()
    }

    pub fn latest_rid(&self, name: &str) -> Option<u16> {
        self.images
            .read()
            .unwrap()
            .iter()
            .filter(|i| i.name() == name)
            .map(|i| i.rid())
            .max()
    }

    /// Creates and registers a sparse local copy for an image discovered on
    /// an upstream peer. Racing sessions converge on one record.
    pub fn create_proxied(
        &self,
        name: &str,
        rid: u16,
        size: u64,
        sparse: bool,
    ) -> crate::Result<Arc<Image>> {
        let _guard = self.create_lock.lock().unwrap();
        if let Some(existing) = self.get_exact(name, rid) {
            return Ok(existing);
        }
        let path = self.base_path.join(format!("{name}.r{rid}"));
        let image = Image::create(&path, name, rid, size, sparse)?;
        self.insert(image)
    }

    pub fn snapshot(&self) -> Vec<Arc<Image>> {
        self.images.read().unwrap().clone()
    }

    /// Shuts down every uplink; part of ordered server teardown.
    pub fn kill_uplinks(&self) {
        for image in self.snapshot() {
            if let Some(uplink) = image.uplink() {
                uplink.shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_image(dir: &Path, rel: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn parse_names() {
        assert_eq!(
            parse_image_file(Path::new("pool/debian.img.r3")),
            Some(("pool/debian.img".into(), 3))
        );
        assert_eq!(parse_image_file(Path::new("noext")), None);
        assert_eq!(parse_image_file(Path::new("zero.r0")), None);
        assert_eq!(parse_image_file(Path::new("bad.rx")), None);
    }

    #[test]
    fn load_all_finds_nested_images() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.r1", &[1u8; 8192]);
        write_image(dir.path(), "sub/b.r2", &[2u8; 4096]);
        write_image(dir.path(), "sub/ignored.txt", b"nope");

        let reg = ImageRegistry::new(dir.path().to_path_buf(), 16);
        assert_eq!(reg.load_all().unwrap(), 2);
        assert!(reg.get("a", 1).is_some());
        assert!(reg.get("sub/b", 2).is_some());
        assert!(reg.get("sub/ignored", 1).is_none());
    }

    #[test]
    fn latest_rid_resolution() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "img.r1", &[0u8; 4096]);
        write_image(dir.path(), "img.r4", &[0u8; 4096]);
        let reg = ImageRegistry::new(dir.path().to_path_buf(), 16);
        reg.load_all().unwrap();

        assert_eq!(reg.get("img", 0).unwrap().rid(), 4);
        assert_eq!(reg.latest_rid("img"), Some(4));
        assert_eq!(reg.get("img", 1).unwrap().rid(), 1);
        assert!(reg.get("img", 3).is_none());
    }

    #[test]
    fn image_without_map_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "c.r1", &[7u8; 12288]);
        let image = Image::open(&path, "c", 1).unwrap();
        assert!(image.is_complete());
        assert_eq!(image.completeness_percent(), 100);
        assert_eq!(image.virtual_size(), 12288);

        let mut buf = [0u8; 16];
        image.read_at(&mut buf, 4096).unwrap();
        assert_eq!(buf, [7u8; 16]);
    }

    #[test]
    fn created_image_tracks_cached_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.r1");
        let image = Image::create(&path, "p", 1, 3 * 4096, true).unwrap();
        assert!(!image.is_complete());
        assert_eq!(image.completeness_percent(), 0);

        image.write_cache(0, &[0xaa; 4096]).unwrap();
        let map = image.cache_map().unwrap();
        assert!(map.get(0));
        assert!(!map.get(1));

        // Map persists
        let raw = std::fs::read(sidecar(&path, "map")).unwrap();
        assert_eq!(raw[0] & 1, 1);

        image.write_cache(4096, &[0xbb; 4096]).unwrap();
        image.write_cache(2 * 4096, &[0xcc; 4096]).unwrap();
        assert!(image.is_complete());
        assert!(!sidecar(&path, "map").exists());

        let mut buf = [0u8; 4096];
        image.read_at(&mut buf, 4096).unwrap();
        assert_eq!(buf[0], 0xbb);
    }

    #[test]
    fn virtual_tail_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "t.r1", &[9u8; 5000]);
        let image = Image::open(&path, "t", 1).unwrap();
        assert_eq!(image.virtual_size(), 8192);

        let mut buf = [1u8; 100];
        image.read_at(&mut buf, 8000).unwrap();
        assert_eq!(buf, [0u8; 100]);
    }
}

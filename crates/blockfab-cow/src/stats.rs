//! Human-readable status file for the CoW session.
//!
//! Rewritten every [`COW_STATS_UPDATE_TIME`]: session uuid, lifecycle
//! state, block counts, active transfers and upload speed. After the final
//! drain a per-block upload table is appended, sorted by upload count.

use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::warn;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::store::CowStore;
use crate::upload::Uploader;
use crate::{COW_MIN_UPLOAD_DELAY, COW_STATS_UPDATE_TIME};

/// Block counters derived from the metadata walk.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BlockCounts {
    /// Dirty and old enough to ship (or shipping is unconditional).
    pub in_queue: u64,
    /// Dirty but still inside the quiescence window.
    pub modified: u64,
    /// Allocated with nothing left to upload.
    pub idle: u64,
}

/// Classifies every allocated entry. `background` mirrors whether the
/// uploader still honors the quiescence window.
pub fn count_blocks(store: &CowStore, background: bool) -> BlockCounts {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut counts = BlockCounts::default();
    store.for_each_entry(|_, entry| {
        if entry.offset() < 0 {
            return;
        }
        let changed = entry.time_changed();
        if changed == 0 {
            counts.idle += 1;
        } else if !background || now > changed + COW_MIN_UPLOAD_DELAY.as_secs() {
            counts.in_queue += 1;
        } else {
            counts.modified += 1;
        }
    });
    counts
}

/// Sorted per-block upload table for the final dump. Keys are u64 and the
/// order comes from `Ord`, largest upload count first.
pub fn upload_dump(store: &CowStore) -> Vec<(u64, u64)> {
    let mut rows: Vec<(u64, u64)> = Vec::new();
    store.for_each_entry(|block, entry| {
        if entry.offset() >= 0 {
            rows.push((block, entry.uploads()));
        }
    });
    rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    rows
}

/// Periodic writer of `status.txt`.
pub struct StatsWriter {
    uploader: Arc<Uploader>,
    path: PathBuf,
}

impl StatsWriter {
    /// Creates the status file and seeds it with the session id.
    pub fn new(uploader: Arc<Uploader>, dir: &Path) -> crate::Result<Self> {
        let path = dir.join("status.txt");
        let store = uploader.store();
        std::fs::write(
            &path,
            format!("uuid={}\nstate=active\n", store.uuid()),
        )?;
        Ok(Self { uploader, path })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        let mut last_update = Instant::now();
        loop {
            tokio::time::sleep(COW_STATS_UPDATE_TIME).await;
            let store = self.uploader.store();
            let counts = count_blocks(store, self.uploader.in_background_loop());

            let bytes = self.uploader.take_bytes_uploaded();
            let elapsed = last_update.elapsed().as_secs();
            last_update = Instant::now();
            let kib_per_sec = bytes as f64 / (1 + elapsed) as f64 / 1000.0;

            let mut body = format!(
                "uuid={}\nstate={}\ninQueue={}\nmodifiedBlocks={}\nidleBlocks={}\ntotalBlocksUploaded={}\nactiveUploads={}\nulspeed={:.2}\n",
                store.uuid(),
                self.uploader.state().as_str(),
                counts.in_queue,
                counts.modified,
                counts.idle,
                self.uploader.total_uploaded(),
                self.uploader.active_uploads(),
                kib_per_sec,
            );

            let done = self.uploader.is_done();
            if done {
                body.push_str("\nblocknumber: uploads\n==Block Upload Dump===\n");
                for (block, uploads) in upload_dump(store) {
                    body.push_str(&format!("{block}: {uploads}\n"));
                }
            }
            if let Err(e) = std::fs::write(&self.path, &body) {
                warn!("could not update cow status file: {e}");
            }
            if done {
                return;
            }
        }
    }
}

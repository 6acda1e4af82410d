//! Background upload pipeline to the merge service.
//!
//! Three HTTP endpoints: `POST /api/create` opens a session and returns a
//! 36-byte session id, `POST /api/update/{uuid}/{block}` receives one
//! entry's bitmap followed by its block payload, `POST /api/startMerge`
//! folds the uploaded overlay into a new revision. Anything but HTTP 200
//! is a retriable failure, five attempts per block.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use reqwest::multipart::Form;
use tokio::task::JoinHandle;

use crate::store::CowStore;
use crate::{
    CowError, COW_L2_SIZE, COW_MAX_PARALLEL_BACKGROUND_UPLOADS, COW_MAX_PARALLEL_UPLOADS,
    COW_METADATA_STORAGE_CAPACITY, COW_MIN_UPLOAD_DELAY, COW_UPLOAD_RETRIES,
};

/// Where and how to upload.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Base URL of the merge service, e.g. `http://cow.example:5000`.
    pub server_url: String,
    /// Ask the server to start merging once the final drain finished.
    pub start_merge: bool,
}

/// Reported lifecycle phase, mirrored into the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Active,
    BackgroundUpload,
    Uploading,
    Done,
}

impl UploadState {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadState::Active => "active",
            UploadState::BackgroundUpload => "backgroundUpload",
            UploadState::Uploading => "uploading",
            UploadState::Done => "done",
        }
    }
}

pub struct Uploader {
    store: Arc<CowStore>,
    client: reqwest::Client,
    config: UploadConfig,
    /// True while in background mode; cleared by the unmount signal.
    upload_loop: AtomicBool,
    loop_done: AtomicBool,
    started: AtomicBool,
    active: AtomicUsize,
    bytes_uploaded: AtomicU64,
    total_uploaded: AtomicU64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Uploader {
    pub fn new(store: Arc<CowStore>, config: UploadConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            client: reqwest::Client::new(),
            config,
            upload_loop: AtomicBool::new(true),
            loop_done: AtomicBool::new(false),
            started: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            bytes_uploaded: AtomicU64::new(0),
            total_uploaded: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &Arc<CowStore> {
        &self.store
    }

    /// Opens the upload session; the response body is exactly the 36-byte
    /// session id, which is persisted into the metadata header.
    pub async fn create_session(&self) -> crate::Result<String> {
        let url = format!("{}/api/create", self.config.server_url);
        let form = Form::new()
            .text("imageName", self.store.image_name().to_string())
            .text("version", self.store.image_rid().to_string())
            .text("bitfieldSize", crate::COW_BITFIELD_SIZE.to_string());
        let response = self.client.post(&url).multipart(form).send().await?;
        if response.status().as_u16() != 200 {
            return Err(CowError::SessionCreate(format!(
                "{url} answered {}",
                response.status()
            )));
        }
        let uuid = response.text().await?;
        if uuid.len() != 36 {
            return Err(CowError::SessionCreate(format!(
                "session id has {} bytes, expected 36",
                uuid.len()
            )));
        }
        self.store.set_uuid(&uuid);
        info!("cow session started, guid: {uuid}");
        Ok(uuid)
    }

    /// Starts the background loop. One task per overlay.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    /// Unmount signal: finish the current pass, then drain everything.
    pub fn stop(&self) {
        self.upload_loop.store(false, Ordering::Release);
    }

    pub fn state(&self) -> UploadState {
        if self.loop_done.load(Ordering::Acquire) {
            UploadState::Done
        } else if !self.upload_loop.load(Ordering::Acquire) {
            UploadState::Uploading
        } else if self.started.load(Ordering::Acquire) {
            UploadState::BackgroundUpload
        } else {
            UploadState::Active
        }
    }

    pub fn is_done(&self) -> bool {
        self.loop_done.load(Ordering::Acquire)
    }

    pub fn active_uploads(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn total_uploaded(&self) -> u64 {
        self.total_uploaded.load(Ordering::Acquire)
    }

    /// Drains the byte counter; the stats task turns it into a speed.
    pub fn take_bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded.swap(0, Ordering::AcqRel)
    }

    pub fn in_background_loop(&self) -> bool {
        self.upload_loop.load(Ordering::Acquire)
    }

    async fn run(self: Arc<Self>) {
        self.started.store(true, Ordering::Release);
        while self.upload_loop.load(Ordering::Acquire) {
            if !self.walk_once(false).await {
                warn!("one or more block uploads failed, will retry next pass");
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        debug!("uploading the remaining blocks");
        let clean = self.walk_once(true).await;
        self.loop_done.store(true, Ordering::Release);
        if !clean {
            error!("one or more blocks failed to upload");
            return;
        }
        debug!("all blocks uploaded");
        if self.config.start_merge {
            if let Err(e) = self.start_merge().await {
                error!("merge request failed: {e}");
            } else {
                debug!("requested merge");
            }
        }
    }

    /// One pass over all allocated entries. In steady state only entries
    /// quiet for [`COW_MIN_UPLOAD_DELAY`] are shipped and parallelism stays
    /// at the background limit; the final drain ignores the delay and uses
    /// the full limit.
    async fn walk_once(&self, ignore_delay: bool) -> bool {
        let limit = if ignore_delay {
            COW_MAX_PARALLEL_UPLOADS
        } else {
            COW_MAX_PARALLEL_BACKGROUND_UPLOADS
        };
        let now = now_secs();
        let mut eligible: Vec<(u64, u64)> = Vec::new();
        self.store.for_each_entry(|block, entry| {
            if entry.offset() < 0 {
                return;
            }
            let changed = entry.time_changed();
            if changed == 0 {
                return;
            }
            if !ignore_delay && now.saturating_sub(changed) < COW_MIN_UPLOAD_DELAY.as_secs() {
                return;
            }
            eligible.push((block, changed));
        });

        let mut success = true;
        let mut inflight = FuturesUnordered::new();
        for (block, captured) in eligible {
            while inflight.len() >= limit {
                if let Some(ok) = inflight.next().await {
                    success &= ok;
                }
            }
            inflight.push(self.upload_block(block, captured));
            // Unmount flips the flag mid-pass; the drain pass follows
            if !ignore_delay && !self.upload_loop.load(Ordering::Acquire) {
                break;
            }
        }
        while let Some(ok) = inflight.next().await {
            success &= ok;
        }
        success
    }

    /// Uploads one entry with retries. On success the dirty timestamp is
    /// cleared only if it still matches the captured value, so writes that
    /// raced the upload keep the entry dirty for the next pass.
    async fn upload_block(&self, block: u64, captured: u64) -> bool {
        self.active.fetch_add(1, Ordering::AcqRel);
        let mut ok = false;
        for attempt in 1..=COW_UPLOAD_RETRIES {
            match self.try_upload(block).await {
                Ok(bytes) => {
                    let entry = self
                        .store
                        .entry(block as usize / COW_L2_SIZE, block as usize % COW_L2_SIZE);
                    if let Some(entry) = entry {
                        entry.clear_time_changed_if(captured);
                        entry.count_upload();
                    }
                    self.total_uploaded.fetch_add(1, Ordering::AcqRel);
                    self.bytes_uploaded.fetch_add(bytes, Ordering::AcqRel);
                    ok = true;
                    break;
                }
                Err(e) => {
                    warn!("upload of block {block} failed {attempt}/{COW_UPLOAD_RETRIES}: {e}");
                }
            }
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
        if !ok {
            error!("giving up on block {block} after {COW_UPLOAD_RETRIES} attempts");
        }
        ok
    }

    async fn try_upload(&self, block: u64) -> crate::Result<u64> {
        let entry = self
            .store
            .entry(block as usize / COW_L2_SIZE, block as usize % COW_L2_SIZE)
            .ok_or_else(|| CowError::DataFormat(format!("block {block} has no entry")))?;
        let offset = entry.offset();
        if offset < 0 {
            return Err(CowError::DataFormat(format!("block {block} unallocated")));
        }

        // Bitmap first, then the payload; the last block may be short
        let mut body = Vec::with_capacity(
            crate::COW_BITFIELD_SIZE + COW_METADATA_STORAGE_CAPACITY as usize,
        );
        body.extend_from_slice(&entry.bitfield_snapshot());
        let mut data = vec![0u8; COW_METADATA_STORAGE_CAPACITY as usize];
        let filled = self.store.read_data(offset as u64, &mut data)?;
        body.extend_from_slice(&data[..filled]);

        let len = body.len() as u64;
        let url = format!(
            "{}/api/update/{}/{}",
            self.config.server_url,
            self.store.uuid(),
            block
        );
        // Floor of 1 KiB/s sustained over the whole transfer, 10 s minimum
        let limit = Duration::from_secs(10 + len / 1024);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .timeout(limit)
            .send()
            .await?;
        if response.status().as_u16() != 200 {
            return Err(CowError::UploadRejected {
                block,
                status: response.status().as_u16(),
            });
        }
        Ok(len)
    }

    /// Asks the server to fold the session into a new revision; retried
    /// like block uploads.
    pub async fn start_merge(&self) -> crate::Result<()> {
        let url = format!("{}/api/startMerge", self.config.server_url);
        let mut last = String::new();
        for attempt in 1..=COW_UPLOAD_RETRIES {
            let form = Form::new()
                .text("guid", self.store.uuid())
                .text("fileSize", self.store.image_size().to_string());
            match self.client.post(&url).multipart(form).send().await {
                Ok(response) if response.status().as_u16() == 200 => return Ok(()),
                Ok(response) => last = format!("{url} answered {}", response.status()),
                Err(e) => last = e.to_string(),
            }
            warn!("merge request failed, trying again {attempt}/{COW_UPLOAD_RETRIES}");
        }
        Err(CowError::MergeFailed(last))
    }
}

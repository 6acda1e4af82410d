//! Server configuration.
//!
//! All resource bounds are enumerated here; memory use is capped by these
//! plus the per-uplink receive buffer (bounded by `max_payload`).

use std::path::PathBuf;

/// Background replication policy for proxied images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BgrMode {
    /// Only blocks that clients actually requested are cached.
    #[default]
    Disabled,
    /// Replicate every missing block in image order.
    Full,
    /// Replicate only toward complete 16 MiB chunks so each finished chunk
    /// can be CRC-verified.
    HashBlock,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory all exported images live under.
    pub base_path: PathBuf,
    /// Act as a caching proxy in front of the alt servers.
    pub is_proxy: bool,
    /// Only use private alt servers as upstreams.
    pub proxy_private_only: bool,
    /// Ask alt servers for images we do not know when a proxying peer
    /// requests them; otherwise such requests are rejected.
    pub lookup_missing_for_proxy: bool,
    /// Create hole-punched cache files instead of preallocating.
    pub sparse_files: bool,
    pub background_replication: BgrMode,
    /// Minimum connected clients before background replication kicks in.
    pub bgr_min_clients: u32,
    /// Do not replicate images larger than this.
    pub max_replication_size: u64,
    pub max_clients: usize,
    pub max_images: usize,
    /// Largest payload accepted in one request/reply.
    pub max_payload: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/srv/blockfab"),
            is_proxy: false,
            proxy_private_only: false,
            lookup_missing_for_proxy: false,
            sparse_files: false,
            background_replication: BgrMode::Disabled,
            bgr_min_clients: 0,
            max_replication_size: u64::MAX,
            max_clients: 2000,
            max_images: 4096,
            max_payload: 9 << 20,
        }
    }
}

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use blockfab_server::{BgrMode, ServerConfig};

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Runs the image server, optionally as a caching proxy.
    Serve(ServeCmd),
    /// Maps a remote image with a local copy-on-write overlay.
    Cow(CowCmd),
    /// Generates the CRC32 integrity sidecar for an image file.
    Crc(CrcCmd),
    /// Creates an empty local image with a zeroed cache map.
    Create(CreateCmd),
}

#[derive(Parser)]
pub struct ServeCmd {
    /// Directory the exported images live in.
    #[arg(short, long)]
    pub base_path: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:5003")]
    pub bind: SocketAddr,

    /// Act as a caching proxy in front of the alt servers.
    #[arg(long)]
    pub proxy: bool,

    /// Only use private alt servers as upstreams.
    #[arg(long)]
    pub proxy_private_only: bool,

    /// Ask alt servers for images unknown locally when a proxying peer
    /// requests them.
    #[arg(long)]
    pub lookup_missing: bool,

    /// Create hole-punched cache files instead of preallocating.
    #[arg(long)]
    pub sparse_files: bool,

    /// Background replication mode.
    #[arg(long, default_value_t = BgrModeArg::Disabled)]
    pub bgr: BgrModeArg,

    /// Minimum connected clients before background replication runs.
    #[arg(long, default_value_t = 0)]
    pub bgr_min_clients: u32,

    /// Known peer, repeatable (host:port).
    #[arg(long = "alt-server")]
    pub alt_servers: Vec<SocketAddr>,

    #[arg(long, default_value_t = 2000)]
    pub max_clients: usize,

    /// Largest payload accepted in one request, bytes.
    #[arg(long, default_value_t = 9 << 20)]
    pub max_payload: u32,
}

#[derive(ValueEnum, Copy, Clone, Debug, Default)]
pub enum BgrModeArg {
    #[default]
    Disabled,
    Full,
    Hashblock,
}

impl std::fmt::Display for BgrModeArg {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BgrModeArg::Disabled => write!(f, "disabled"),
            BgrModeArg::Full => write!(f, "full"),
            BgrModeArg::Hashblock => write!(f, "hashblock"),
        }
    }
}

impl From<BgrModeArg> for BgrMode {
    fn from(mode: BgrModeArg) -> Self {
        match mode {
            BgrModeArg::Disabled => BgrMode::Disabled,
            BgrModeArg::Full => BgrMode::Full,
            BgrModeArg::Hashblock => BgrMode::HashBlock,
        }
    }
}

impl ServeCmd {
    pub fn make_server_config(&self) -> ServerConfig {
        ServerConfig {
            base_path: self.base_path.clone(),
            is_proxy: self.proxy,
            proxy_private_only: self.proxy_private_only,
            lookup_missing_for_proxy: self.lookup_missing,
            sparse_files: self.sparse_files,
            background_replication: self.bgr.into(),
            bgr_min_clients: self.bgr_min_clients,
            max_clients: self.max_clients,
            max_payload: self.max_payload,
            ..Default::default()
        }
    }
}

#[derive(Parser)]
pub struct CowCmd {
    /// Origin image server (host:port).
    #[arg(short, long)]
    pub server: SocketAddr,

    /// Image name to map.
    #[arg(short, long)]
    pub image: String,

    /// Revision to pin; 0 selects the newest.
    #[arg(short, long, default_value_t = 0)]
    pub rid: u16,

    /// Directory for the overlay files and status.txt.
    #[arg(short = 'd', long)]
    pub cow_dir: PathBuf,

    /// Base URL of the merge service.
    #[arg(short, long)]
    pub upload_url: String,

    /// Request a server-side merge after the final upload.
    #[arg(long)]
    pub merge: bool,

    /// Reopen an existing overlay instead of creating a fresh one.
    #[arg(long)]
    pub load: bool,
}

#[derive(Parser)]
pub struct CrcCmd {
    /// Image file to hash.
    pub image: PathBuf,
}

#[derive(Parser)]
pub struct CreateCmd {
    /// Directory the image should be created in.
    #[arg(short, long)]
    pub base_path: PathBuf,

    /// Image name.
    #[arg(short, long)]
    pub image: String,

    /// Revision id.
    #[arg(short, long)]
    pub revision: u16,

    /// Virtual size in bytes.
    #[arg(short, long)]
    pub size: u64,
}

#![forbid(unsafe_code)]
//! The blockfab image server: exports fixed-revision disk images over the
//! block protocol and, in proxy mode, caches an upstream peer's images
//! block by block while serving clients from whatever is already local.

pub mod client;
pub mod config;
pub mod error;
pub mod image;
pub mod integrity;
pub mod server;
pub mod uplink;

pub use config::{BgrMode, ServerConfig};
pub use error::ServerError;
pub use image::{Image, ImageRegistry};
pub use integrity::{CrcList, IntegrityChecker};
pub use server::{Server, ServerHandle};
pub use uplink::Uplink;

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#![forbid(unsafe_code)]
//! Wire and on-disk formats shared by every blockfab component.
//!
//! The block protocol is little-endian on the wire; all fixed structures are
//! declared with binrw so endian normalization happens in the codec layer
//! and nowhere else.

pub mod bitmap;
pub mod error;
pub mod header;
pub mod peer;
pub mod serializer;

pub use bitmap::BlockBitmap;
pub use error::ProtoError;
pub use header::{Command, ReplyHeader, RequestHeader, PROTO_MAGIC};
pub use peer::{PeerEntry, PeerFamily};
pub use serializer::{Payload, SelectImageReply, SelectImageRequest};

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Granularity of cache maps, CoW bitfields and protocol alignment rules.
pub const BLOCK_SIZE: u64 = 4096;

/// Chunk size covered by one CRC32 entry in an integrity sidecar.
pub const HASH_BLOCK_SIZE: u64 = 16 * 1024 * 1024;

/// Version of the block protocol spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 3;

/// Oldest peer protocol version we are willing to talk to by default.
pub const MIN_SUPPORTED_PEER: u16 = 2;

/// Rounds a virtual image size up to the next block boundary.
pub const fn align_up(size: u64) -> u64 {
    (size + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1)
}

/// Rounds an offset down to its containing block boundary.
pub const fn align_down(offset: u64) -> u64 {
    offset & !(BLOCK_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), BLOCK_SIZE);
        assert_eq!(align_up(BLOCK_SIZE), BLOCK_SIZE);
        assert_eq!(align_up(BLOCK_SIZE + 1), 2 * BLOCK_SIZE);
        assert_eq!(align_down(BLOCK_SIZE - 1), 0);
        assert_eq!(align_down(2 * BLOCK_SIZE + 7), 2 * BLOCK_SIZE);
    }
}

//! Transport error type.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised by connection setup, framed I/O and discovery.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed after {attempts} attempts: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        attempts: u32,
        source: std::io::Error,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("peer speaks protocol version {got}, minimum supported is {min}")]
    PeerTooOld { got: u16, min: u16 },

    #[error("peer exports a different image (expected {expected}, got {got})")]
    ImageMismatch { expected: String, got: String },

    #[error("codec error: {0}")]
    Proto(#[from] blockfab_proto::ProtoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Shorthand used when a reply violates the framing rules.
    pub fn protocol(msg: impl Into<String>) -> Self {
        TransportError::Protocol(msg.into())
    }
}

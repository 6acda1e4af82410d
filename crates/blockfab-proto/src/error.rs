//! Codec error type.

use thiserror::Error;

/// Errors produced while encoding or decoding protocol structures.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("payload underflow: tried to read {wanted} bytes, {remaining} remaining")]
    PayloadUnderflow { wanted: usize, remaining: usize },

    #[error("payload overflow: capacity is {capacity} bytes")]
    PayloadOverflow { capacity: usize },

    #[error("string field is not valid UTF-8")]
    InvalidString,

    #[error("string field of {0} bytes exceeds the wire limit")]
    StringTooLong(usize),

    #[error("unknown address family {0}")]
    UnknownFamily(u8),

    #[error("binary (de)serialization failed: {0}")]
    BinRw(#[from] binrw::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

//! CoW error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CowError {
    #[error("metadata file is invalid: {0}")]
    MetaFormat(String),

    #[error("metadata or data file has the wrong endianness")]
    WrongEndianness,

    #[error("data file is invalid: {0}")]
    DataFormat(String),

    #[error("offset {0} is beyond the maximum image size")]
    BeyondMaxSize(u64),

    #[error("upload session could not be created: {0}")]
    SessionCreate(String),

    #[error("server answered {status} for block {block}")]
    UploadRejected { block: u64, status: u16 },

    #[error("merge request was rejected: {0}")]
    MergeFailed(String),

    #[error("origin read failed: {0}")]
    Origin(std::io::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("codec: {0}")]
    Proto(#[from] blockfab_proto::ProtoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

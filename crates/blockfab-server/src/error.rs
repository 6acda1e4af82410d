//! Server error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("image {name}:{rid} is not known")]
    ImageNotFound { name: String, rid: u16 },

    #[error("image {0} is marked not working")]
    ImageNotWorking(String),

    #[error("image limit of {0} reached")]
    TooManyImages(usize),

    #[error("client limit of {0} reached")]
    TooManyClients(usize),

    #[error("integrity sidecar is corrupt: {0}")]
    CrcFile(String),

    #[error("protocol violation from client: {0}")]
    Protocol(String),

    #[error("uplink queue is full")]
    UplinkQueueFull,

    #[error("request exceeded the proxy hop limit")]
    HopLimit,

    #[error("transport: {0}")]
    Transport(#[from] blockfab_transport::TransportError),

    #[error("codec: {0}")]
    Proto(#[from] blockfab_proto::ProtoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        ServerError::Protocol(msg.into())
    }
}

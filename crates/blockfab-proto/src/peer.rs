//! Alt-server entries as exchanged in `GET_SERVERS` payloads.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use binrw::prelude::*;

/// Address family tag of a [`PeerEntry`].
#[derive(BinRead, BinWrite, Debug, PartialEq, Eq, Clone, Copy)]
#[brw(repr(u8))]
pub enum PeerFamily {
    V4 = 4,
    V6 = 6,
}

/// One alt-server record on the wire: 16-byte address (v4 in the first four
/// bytes), port, and the sender's failure count for that peer. A failure
/// count of zero means "add", anything else means "remove".
#[binrw]
#[brw(little)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct PeerEntry {
    pub family: PeerFamily,
    pub addr: [u8; 16],
    pub port: u16,
    pub failures: u8,
}

/// Encoded size of a [`PeerEntry`].
pub const PEER_ENTRY_SIZE: usize = 20;

impl PeerEntry {
    pub fn new(addr: SocketAddr, failures: u8) -> Self {
        let (family, bytes) = match addr.ip() {
            IpAddr::V4(v4) => {
                let mut raw = [0u8; 16];
                raw[..4].copy_from_slice(&v4.octets());
                (PeerFamily::V4, raw)
            }
            IpAddr::V6(v6) => (PeerFamily::V6, v6.octets()),
        };
        Self {
            family,
            addr: bytes,
            port: addr.port(),
            failures,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let ip = match self.family {
            PeerFamily::V4 => {
                let raw: [u8; 4] = self.addr[..4].try_into().unwrap();
                IpAddr::V4(Ipv4Addr::from(raw))
            }
            PeerFamily::V6 => IpAddr::V6(Ipv6Addr::from(self.addr)),
        };
        SocketAddr::new(ip, self.port)
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        let mut cursor = std::io::Cursor::new(Vec::with_capacity(PEER_ENTRY_SIZE));
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    pub fn read_from(bytes: &[u8]) -> crate::Result<Self> {
        Ok(Self::read(&mut std::io::Cursor::new(bytes))?)
    }
}

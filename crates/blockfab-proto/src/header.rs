//! Fixed request/reply headers and command codes.

use binrw::prelude::*;

/// Magic value leading every message on the wire.
pub const PROTO_MAGIC: u16 = 0x7319;

/// Size of an encoded [`RequestHeader`] in bytes.
pub const REQUEST_HEADER_SIZE: usize = 24;

/// Size of an encoded [`ReplyHeader`] in bytes.
pub const REPLY_HEADER_SIZE: usize = 16;

/// `GET_BLOCK` offsets use the low 56 bits; the top byte carries the hop
/// count a request has taken across proxies.
pub const OFFSET_MASK: u64 = 0x00ff_ffff_ffff_ffff;

/// Block protocol command codes.
#[derive(BinRead, BinWrite, Debug, PartialEq, Eq, Clone, Copy)]
#[brw(repr(u16))]
pub enum Command {
    /// Range read; request carries offset and size, reply carries the bytes.
    GetBlock = 1,
    /// Open/handshake carrying image identity in a serialized payload.
    SelectImage = 2,
    /// Exchange of known alternative servers.
    GetServers = 3,
    /// Failure reply for a request that cannot be served.
    Error = 4,
    /// Connection liveness probe, no payload.
    Keepalive = 5,
    /// Probe for the newest revision of the selected image.
    LatestRid = 6,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::GetBlock => "Get Block",
            Command::SelectImage => "Select Image",
            Command::GetServers => "Get Servers",
            Command::Error => "Error",
            Command::Keepalive => "Keepalive",
            Command::LatestRid => "Latest Rid",
        };
        write!(f, "{} ({:#x})", name, *self as u16)
    }
}

/// Header of every client-to-server message.
///
/// `handle` is opaque to the receiver and returned verbatim in the matching
/// reply. `size` is the payload length for commands that carry one, or the
/// number of bytes requested for [`Command::GetBlock`].
#[binrw]
#[brw(little, magic(0x7319u16))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RequestHeader {
    pub command: Command,
    pub size: u32,
    pub handle: u64,
    pub offset: u64,
}

impl RequestHeader {
    /// Builds a range-read request for `size` bytes at `offset`.
    pub fn get_block(handle: u64, offset: u64, size: u32) -> Self {
        Self::get_block_hops(handle, offset, size, 0)
    }

    /// Range-read request carrying a proxy hop count in the offset's top
    /// byte.
    pub fn get_block_hops(handle: u64, offset: u64, size: u32, hops: u8) -> Self {
        Self {
            command: Command::GetBlock,
            size,
            handle,
            offset: (offset & OFFSET_MASK) | (hops as u64) << 56,
        }
    }

    /// Byte offset of a `GET_BLOCK` request, hop bits stripped.
    pub fn block_offset(&self) -> u64 {
        self.offset & OFFSET_MASK
    }

    /// Proxy hop count of a `GET_BLOCK` request.
    pub fn hop_count(&self) -> u8 {
        (self.offset >> 56) as u8
    }

    /// Builds a payload-carrying request (offset is meaningless and zero).
    pub fn with_payload(command: Command, handle: u64, payload_len: u32) -> Self {
        Self {
            command,
            size: payload_len,
            handle,
            offset: 0,
        }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> crate::Result<()> {
        let mut cursor = std::io::Cursor::new(buf);
        cursor.set_position(cursor.get_ref().len() as u64);
        self.write(&mut cursor)?;
        Ok(())
    }

    pub fn read_from(bytes: &[u8]) -> crate::Result<Self> {
        Ok(Self::read(&mut std::io::Cursor::new(bytes))?)
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(REQUEST_HEADER_SIZE);
        self.write_to(&mut buf)?;
        Ok(buf)
    }
}

/// Header of every server-to-client message.
///
/// `size` bytes of payload follow immediately after the header.
#[binrw]
#[brw(little, magic(0x7319u16))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ReplyHeader {
    pub command: Command,
    pub size: u32,
    pub handle: u64,
}

impl ReplyHeader {
    pub fn new(command: Command, handle: u64, size: u32) -> Self {
        Self {
            command,
            size,
            handle,
        }
    }

    /// Error reply addressed to the request identified by `handle`.
    pub fn error(handle: u64) -> Self {
        Self::new(Command::Error, handle, 0)
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> crate::Result<()> {
        let mut cursor = std::io::Cursor::new(buf);
        cursor.set_position(cursor.get_ref().len() as u64);
        self.write(&mut cursor)?;
        Ok(())
    }

    pub fn read_from(bytes: &[u8]) -> crate::Result<Self> {
        Ok(Self::read(&mut std::io::Cursor::new(bytes))?)
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(REPLY_HEADER_SIZE);
        self.write_to(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn request_header_round_trip() {
        let req = RequestHeader::get_block(0x42, 0x1000, 4096);
        let bytes = req.to_bytes().unwrap();
        assert_eq!(bytes.len(), REQUEST_HEADER_SIZE);
        assert_eq!(
            hex(&bytes),
            "197301000010000042000000000000000010000000000000"
        );
        assert_eq!(RequestHeader::read_from(&bytes).unwrap(), req);
    }

    #[test]
    fn reply_header_round_trip() {
        let reply = ReplyHeader::new(Command::GetBlock, 0x42, 4096);
        let bytes = reply.to_bytes().unwrap();
        assert_eq!(bytes.len(), REPLY_HEADER_SIZE);
        assert_eq!(hex(&bytes), "19730100001000004200000000000000");
        assert_eq!(ReplyHeader::read_from(&bytes).unwrap(), reply);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = ReplyHeader::error(7).to_bytes().unwrap();
        bytes[0] ^= 0xff;
        assert!(ReplyHeader::read_from(&bytes).is_err());
    }

    #[test]
    fn hop_bits_ride_in_the_offset() {
        let req = RequestHeader::get_block_hops(1, 0x1234_5678, 4096, 3);
        assert_eq!(req.block_offset(), 0x1234_5678);
        assert_eq!(req.hop_count(), 3);
        let back = RequestHeader::read_from(&req.to_bytes().unwrap()).unwrap();
        assert_eq!(back.hop_count(), 3);
        assert_eq!(back.block_offset(), 0x1234_5678);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut bytes = ReplyHeader::error(7).to_bytes().unwrap();
        bytes[2] = 0x63;
        assert!(ReplyHeader::read_from(&bytes).is_err());
    }
}

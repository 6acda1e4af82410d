//! Self-describing payload serializer.
//!
//! Commands that carry structured payloads (notably `SELECT_IMAGE`) encode
//! them with typed little-endian put/get operations backed by a bounded
//! buffer. Strings are length-prefixed with a u16. A read cursor tracks the
//! remaining bytes and fails the message on underflow instead of reading
//! garbage.

use crate::ProtoError;

/// Upper bound for a serialized payload. Large transfers go through
/// `GET_BLOCK`, so structured payloads stay small.
pub const PAYLOAD_CAPACITY: usize = 1000;

/// Bounded read/write buffer with typed accessors.
#[derive(Debug, Default, Clone)]
pub struct Payload {
    buf: Vec<u8>,
    cursor: usize,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps received bytes for reading.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            buf: bytes,
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn ensure_space(&self, extra: usize) -> crate::Result<()> {
        if self.buf.len() + extra > PAYLOAD_CAPACITY {
            return Err(ProtoError::PayloadOverflow {
                capacity: PAYLOAD_CAPACITY,
            });
        }
        Ok(())
    }

    fn take(&mut self, wanted: usize) -> crate::Result<&[u8]> {
        let remaining = self.buf.len() - self.cursor;
        if wanted > remaining {
            return Err(ProtoError::PayloadUnderflow { wanted, remaining });
        }
        let slice = &self.buf[self.cursor..self.cursor + wanted];
        self.cursor += wanted;
        Ok(slice)
    }

    pub fn put_u8(&mut self, value: u8) -> crate::Result<()> {
        self.ensure_space(1)?;
        self.buf.push(value);
        Ok(())
    }

    pub fn put_u16(&mut self, value: u16) -> crate::Result<()> {
        self.ensure_space(2)?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn put_u32(&mut self, value: u32) -> crate::Result<()> {
        self.ensure_space(4)?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn put_u64(&mut self, value: u64) -> crate::Result<()> {
        self.ensure_space(8)?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Writes a u16 length prefix followed by the UTF-8 bytes.
    pub fn put_str(&mut self, value: &str) -> crate::Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(ProtoError::StringTooLong(bytes.len()));
        }
        self.ensure_space(2 + bytes.len())?;
        self.put_u16(bytes.len() as u16)?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn get_u8(&mut self) -> crate::Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> crate::Result<u16> {
        let raw: [u8; 2] = self.take(2)?.try_into().unwrap();
        Ok(u16::from_le_bytes(raw))
    }

    pub fn get_u32(&mut self) -> crate::Result<u32> {
        let raw: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(u32::from_le_bytes(raw))
    }

    pub fn get_u64(&mut self) -> crate::Result<u64> {
        let raw: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(u64::from_le_bytes(raw))
    }

    pub fn get_str(&mut self) -> crate::Result<String> {
        let len = self.get_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtoError::InvalidString)
    }
}

/// `SELECT_IMAGE` request payload: who we are and which image we want.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectImageRequest {
    pub protocol_version: u16,
    pub name: String,
    pub rid: u16,
    /// Set when the requester is itself a server acting as a proxy.
    pub is_server: bool,
}

impl SelectImageRequest {
    pub fn serialize(&self) -> crate::Result<Payload> {
        let mut payload = Payload::new();
        payload.put_u16(self.protocol_version)?;
        payload.put_str(&self.name)?;
        payload.put_u16(self.rid)?;
        payload.put_u8(self.is_server as u8)?;
        Ok(payload)
    }

    pub fn deserialize(payload: &mut Payload) -> crate::Result<Self> {
        Ok(Self {
            protocol_version: payload.get_u16()?,
            name: payload.get_str()?,
            rid: payload.get_u16()?,
            is_server: payload.get_u8()? != 0,
        })
    }
}

/// `SELECT_IMAGE` reply payload: the canonical identity of the opened image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectImageReply {
    pub protocol_version: u16,
    pub name: String,
    pub rid: u16,
    pub file_size: u64,
}

impl SelectImageReply {
    pub fn serialize(&self) -> crate::Result<Payload> {
        let mut payload = Payload::new();
        payload.put_u16(self.protocol_version)?;
        payload.put_str(&self.name)?;
        payload.put_u16(self.rid)?;
        payload.put_u64(self.file_size)?;
        Ok(payload)
    }

    pub fn deserialize(payload: &mut Payload) -> crate::Result<Self> {
        Ok(Self {
            protocol_version: payload.get_u16()?,
            name: payload.get_str()?,
            rid: payload.get_u16()?,
            file_size: payload.get_u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_round_trip() {
        let mut payload = Payload::new();
        payload.put_u8(0xab).unwrap();
        payload.put_u16(0xbeef).unwrap();
        payload.put_u32(0xdeadbeef).unwrap();
        payload.put_u64(0x0123_4567_89ab_cdef).unwrap();
        payload.put_str("images/linux.img").unwrap();

        let mut rd = Payload::from_bytes(payload.into_bytes());
        assert_eq!(rd.get_u8().unwrap(), 0xab);
        assert_eq!(rd.get_u16().unwrap(), 0xbeef);
        assert_eq!(rd.get_u32().unwrap(), 0xdeadbeef);
        assert_eq!(rd.get_u64().unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(rd.get_str().unwrap(), "images/linux.img");
        assert!(rd.get_u8().is_err());
    }

    #[test]
    fn underflow_is_an_error() {
        let mut rd = Payload::from_bytes(vec![1, 2, 3]);
        assert_eq!(rd.get_u16().unwrap(), 0x0201);
        match rd.get_u32() {
            Err(ProtoError::PayloadUnderflow { wanted, remaining }) => {
                assert_eq!((wanted, remaining), (4, 1));
            }
            other => panic!("expected underflow, got {other:?}"),
        }
    }

    #[test]
    fn truncated_string_is_an_error() {
        let mut payload = Payload::new();
        payload.put_u16(32).unwrap();
        payload.put_u8(b'x').unwrap();
        let mut rd = Payload::from_bytes(payload.into_bytes());
        assert!(rd.get_str().is_err());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut payload = Payload::new();
        let big = "x".repeat(PAYLOAD_CAPACITY);
        assert!(matches!(
            payload.put_str(&big),
            Err(ProtoError::PayloadOverflow { .. })
        ));
    }

    #[test]
    fn select_image_round_trip() {
        let req = SelectImageRequest {
            protocol_version: crate::PROTOCOL_VERSION,
            name: "pool/debian-13.img".to_string(),
            rid: 7,
            is_server: true,
        };
        let mut payload = Payload::from_bytes(req.serialize().unwrap().into_bytes());
        assert_eq!(SelectImageRequest::deserialize(&mut payload).unwrap(), req);

        let reply = SelectImageReply {
            protocol_version: crate::PROTOCOL_VERSION,
            name: "pool/debian-13.img".to_string(),
            rid: 7,
            file_size: 16 * 1024 * 1024 * 1024,
        };
        let mut payload = Payload::from_bytes(reply.serialize().unwrap().into_bytes());
        assert_eq!(SelectImageReply::deserialize(&mut payload).unwrap(), reply);
    }
}

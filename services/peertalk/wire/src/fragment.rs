//! Fragment header processing for the wire protocol.
//!
//! A message larger than a peer's negotiated capacity is split into
//! fragments. Each fragment payload is prefixed by this 8-byte header
//! (inside the normal message framing, with the FRAGMENT flag set) so
//! the receiver can place it at the right offset during reassembly.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Fragment header size in bytes
pub const FRAGMENT_HEADER_SIZE: usize = 8;

bitflags! {
    /// Fragment flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FragFlags: u8 {
        /// First fragment of a message (offset 0)
        const FIRST = 0x01;
        /// Last fragment of a message
        const LAST = 0x02;
    }
}

/// Fragment header structure (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentHeader {
    /// Identifier shared by all fragments of one message
    pub message_id: u16,
    /// Total length of the original message
    pub total_len: u16,
    /// Byte offset of this fragment within the original message
    pub offset: u16,
    /// First/last markers
    pub flags: FragFlags,
}

impl FragmentHeader {
    /// Create a new fragment header
    pub fn new(message_id: u16, total_len: u16, offset: u16, flags: FragFlags) -> Self {
        Self {
            message_id,
            total_len,
            offset,
            flags,
        }
    }

    /// Encode the fragment header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.message_id);
        buf.put_u16(self.total_len);
        buf.put_u16(self.offset);
        buf.put_u8(self.flags.bits());
        buf.put_u8(0); // reserved
    }

    /// Decode the fragment header from bytes (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < FRAGMENT_HEADER_SIZE {
            return Err(crate::WireError::Truncated);
        }

        let message_id = buf.get_u16();
        let total_len = buf.get_u16();
        let offset = buf.get_u16();
        let flags = FragFlags::from_bits(buf.get_u8()).ok_or(crate::WireError::Reserved)?;
        let reserved = buf.get_u8();
        if reserved != 0 {
            return Err(crate::WireError::Reserved);
        }

        Ok(Self {
            message_id,
            total_len,
            offset,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_header_roundtrip() {
        let header = FragmentHeader::new(0x1234, 10_000, 2040, FragFlags::LAST);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FRAGMENT_HEADER_SIZE);

        let decoded = FragmentHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_reserved_byte_must_be_zero() {
        let header = FragmentHeader::new(1, 100, 0, FragFlags::FIRST);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf[7] = 0x01;

        assert_eq!(
            FragmentHeader::decode(&mut buf.freeze()),
            Err(crate::WireError::Reserved)
        );
    }

    #[test]
    fn test_unknown_flag_bits_rejected() {
        let header = FragmentHeader::new(1, 100, 0, FragFlags::FIRST);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf[6] = 0xF0;

        assert_eq!(
            FragmentHeader::decode(&mut buf.freeze()),
            Err(crate::WireError::Reserved)
        );
    }

    #[test]
    fn test_truncated() {
        let mut buf = Bytes::from_static(&[0, 1, 2]);
        assert_eq!(
            FragmentHeader::decode(&mut buf),
            Err(crate::WireError::Truncated)
        );
    }
}

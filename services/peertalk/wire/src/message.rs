//! Message header and frame processing for the wire protocol.
//!
//! This module defines the 10-byte message header that precedes every
//! reliable-transport payload, the CRC-16 framing around it, and the
//! 4-byte per-entry prefix used when several small messages are packed
//! into one batch frame.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::checksum::crc16;

/// Wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Message frame magic
pub const MESSAGE_MAGIC: [u8; 4] = *b"PTMG";

/// Message header size in bytes
pub const MSG_HEADER_SIZE: usize = 10;

/// Maximum message payload size in bytes
pub const MAX_PAYLOAD_SIZE: usize = 65_535;

/// Per-entry header size inside a batch payload
pub const BATCH_ENTRY_HEADER_SIZE: usize = 4;

/// Message types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    /// Application data
    Data = 0x01,
    /// Liveness probe
    Ping = 0x02,
    /// Liveness probe response
    Pong = 0x03,
    /// Graceful disconnect notification
    Disconnect = 0x04,
    /// Acknowledgment
    Ack = 0x05,
    /// Rejected message notification
    Reject = 0x06,
    /// Capability negotiation record
    Capability = 0x07,
}

impl TryFrom<u8> for MsgType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MsgType::Data),
            0x02 => Ok(MsgType::Ping),
            0x03 => Ok(MsgType::Pong),
            0x04 => Ok(MsgType::Disconnect),
            0x05 => Ok(MsgType::Ack),
            0x06 => Ok(MsgType::Reject),
            0x07 => Ok(MsgType::Capability),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Message flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MsgFlags: u8 {
        /// Deliver over the unreliable transport when available
        const UNRELIABLE = 0x01;
        /// Newer message with the same key may replace this one
        const COALESCABLE = 0x02;
        /// Send without batching delay
        const NO_DELAY = 0x04;
        /// Payload is a batch of length-prefixed entries
        const BATCH = 0x08;
        /// Payload starts with a fragment header
        const FRAGMENT = 0x10;
    }
}

/// Message header structure (10 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgHeader {
    /// Message type
    pub typ: MsgType,
    /// Message flags
    pub flags: MsgFlags,
    /// Per-peer wrapping sequence number
    pub seq: u8,
    /// Payload length in bytes
    pub payload_len: u16,
}

impl MsgHeader {
    /// Create a new message header
    pub fn new(typ: MsgType, seq: u8, payload_len: u16) -> Self {
        Self {
            typ,
            flags: MsgFlags::empty(),
            seq,
            payload_len,
        }
    }

    /// Encode the message header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&MESSAGE_MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.typ as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.seq);
        buf.put_u16(self.payload_len);
    }

    /// Decode the message header from bytes (big-endian)
    ///
    /// The header carries no checksum of its own; the frame trailer CRC
    /// covers header and payload together and is validated by
    /// [`decode_frame`].
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < MSG_HEADER_SIZE {
            return Err(crate::WireError::Truncated);
        }

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MESSAGE_MAGIC {
            return Err(crate::WireError::Magic);
        }

        let ver = buf.get_u8();
        if ver != PROTOCOL_VERSION {
            return Err(crate::WireError::Version(ver));
        }

        let typ = MsgType::try_from(buf.get_u8())?;
        let flags = MsgFlags::from_bits(buf.get_u8()).ok_or(crate::WireError::Reserved)?;
        let seq = buf.get_u8();
        let payload_len = buf.get_u16();

        Ok(Self {
            typ,
            flags,
            seq,
            payload_len,
        })
    }
}

/// Encode a complete message frame: header, payload, CRC-16 trailer
pub fn encode_frame(header: &MsgHeader, payload: &[u8], buf: &mut BytesMut) {
    debug_assert_eq!(header.payload_len as usize, payload.len());

    let start = buf.len();
    header.encode(buf);
    buf.put_slice(payload);
    let crc = crc16(&buf[start..]);
    buf.put_u16(crc);
}

/// Decode and validate one complete message frame
///
/// Consumes the frame from `buf` only when it validates; on any error
/// the buffer is left untouched so the caller can resynchronize or wait
/// for more bytes.
pub fn decode_frame(buf: &mut Bytes) -> Result<(MsgHeader, Bytes), crate::WireError> {
    let mut peek = buf.clone();
    let header = MsgHeader::decode(&mut peek)?;

    let total = MSG_HEADER_SIZE + header.payload_len as usize + 2;
    if buf.len() < total {
        return Err(crate::WireError::Truncated);
    }

    let actual = crc16(&buf[..total - 2]);
    let expected = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);
    if actual != expected {
        return Err(crate::WireError::Crc { expected, actual });
    }

    buf.advance(MSG_HEADER_SIZE);
    let payload = buf.split_to(header.payload_len as usize);
    buf.advance(2);

    Ok((header, payload))
}

/// Append one batch entry: u16 length, two reserved zero bytes, payload
pub fn encode_batch_entry(buf: &mut BytesMut, payload: &[u8]) {
    debug_assert!(payload.len() <= u16::MAX as usize);
    buf.put_u16(payload.len() as u16);
    buf.put_u16(0);
    buf.put_slice(payload);
}

/// Iterator over the entries of a batch payload
pub struct BatchIter {
    buf: Bytes,
}

impl BatchIter {
    /// Create an iterator over a batch payload
    pub fn new(payload: Bytes) -> Self {
        Self { buf: payload }
    }
}

impl Iterator for BatchIter {
    type Item = Result<Bytes, crate::WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf.len() < BATCH_ENTRY_HEADER_SIZE {
            self.buf.clear();
            return Some(Err(crate::WireError::Truncated));
        }

        let len = self.buf.get_u16() as usize;
        let reserved = self.buf.get_u16();
        if reserved != 0 {
            self.buf.clear();
            return Some(Err(crate::WireError::Reserved));
        }
        if self.buf.len() < len {
            self.buf.clear();
            return Some(Err(crate::WireError::Truncated));
        }

        Some(Ok(self.buf.split_to(len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_type_conversion() {
        assert_eq!(MsgType::try_from(0x01).unwrap(), MsgType::Data);
        assert_eq!(MsgType::try_from(0x07).unwrap(), MsgType::Capability);
        assert!(MsgType::try_from(0x00).is_err());
        assert!(MsgType::try_from(0x08).is_err());
    }

    #[test]
    fn test_flags() {
        let flags = MsgFlags::BATCH | MsgFlags::NO_DELAY;
        assert!(flags.contains(MsgFlags::BATCH));
        assert!(!flags.contains(MsgFlags::FRAGMENT));
        assert!(MsgFlags::from_bits(0x80).is_none());
    }

    #[test]
    fn test_header_encode_decode() {
        let mut header = MsgHeader::new(MsgType::Data, 42, 1234);
        header.flags = MsgFlags::COALESCABLE | MsgFlags::BATCH;

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), MSG_HEADER_SIZE);

        let mut bytes = buf.freeze();
        let decoded = MsgHeader::decode(&mut bytes).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut buf = BytesMut::new();
        MsgHeader::new(MsgType::Ping, 0, 0).encode(&mut buf);
        buf[0] = b'X';
        assert_eq!(
            MsgHeader::decode(&mut buf.freeze()),
            Err(crate::WireError::Magic)
        );
    }

    #[test]
    fn test_frame_roundtrip() {
        let payload = b"state update";
        let header = MsgHeader::new(MsgType::Data, 7, payload.len() as u16);

        let mut buf = BytesMut::new();
        encode_frame(&header, payload, &mut buf);
        assert_eq!(buf.len(), MSG_HEADER_SIZE + payload.len() + 2);

        let mut bytes = buf.freeze();
        let (decoded, body) = decode_frame(&mut bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(&body[..], payload);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_frame_detects_bit_flip() {
        let payload = b"state update";
        let header = MsgHeader::new(MsgType::Data, 7, payload.len() as u16);

        let mut buf = BytesMut::new();
        encode_frame(&header, payload, &mut buf);

        // Flip one payload bit; CRC validation must reject the frame
        // before any bytes are consumed.
        buf[MSG_HEADER_SIZE + 3] ^= 0x20;
        let len_before = buf.len();
        let mut bytes = buf.freeze();
        assert!(matches!(
            decode_frame(&mut bytes),
            Err(crate::WireError::Crc { .. })
        ));
        assert_eq!(bytes.len(), len_before);
    }

    #[test]
    fn test_frame_truncated() {
        let header = MsgHeader::new(MsgType::Data, 0, 100);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.put_slice(&[0u8; 10]); // far short of the declared payload

        assert_eq!(
            decode_frame(&mut buf.freeze()),
            Err(crate::WireError::Truncated)
        );
    }

    #[test]
    fn test_batch_entries_roundtrip() {
        let mut buf = BytesMut::new();
        encode_batch_entry(&mut buf, b"first");
        encode_batch_entry(&mut buf, b"second entry");
        encode_batch_entry(&mut buf, b"");

        let entries: Vec<Bytes> = BatchIter::new(buf.freeze())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(&entries[0][..], b"first");
        assert_eq!(&entries[1][..], b"second entry");
        assert!(entries[2].is_empty());
    }

    #[test]
    fn test_batch_rejects_nonzero_reserved() {
        let mut buf = BytesMut::new();
        buf.put_u16(3);
        buf.put_u16(0xBEEF);
        buf.put_slice(b"abc");

        let mut iter = BatchIter::new(buf.freeze());
        assert_eq!(iter.next(), Some(Err(crate::WireError::Reserved)));
        assert_eq!(iter.next(), None);
    }
}

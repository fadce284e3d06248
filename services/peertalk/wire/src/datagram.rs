//! Unreliable datagram header processing.
//!
//! Datagrams ride the unreliable transport with a minimal 8-byte header
//! and no CRC; the transport's own integrity check (or the application)
//! is expected to cope with corruption and loss.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Datagram magic
pub const DATAGRAM_MAGIC: [u8; 4] = *b"PTUD";

/// Datagram header size in bytes
pub const DATAGRAM_HEADER_SIZE: usize = 8;

/// Datagram header structure (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatagramHeader {
    /// Port the sender accepts reliable connections on
    pub sender_port: u16,
    /// Payload length in bytes
    pub payload_len: u16,
}

impl DatagramHeader {
    /// Encode the datagram header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&DATAGRAM_MAGIC);
        buf.put_u16(self.sender_port);
        buf.put_u16(self.payload_len);
    }

    /// Decode the datagram header from bytes (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < DATAGRAM_HEADER_SIZE {
            return Err(crate::WireError::Truncated);
        }

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != DATAGRAM_MAGIC {
            return Err(crate::WireError::Magic);
        }

        let sender_port = buf.get_u16();
        let payload_len = buf.get_u16();

        Ok(Self {
            sender_port,
            payload_len,
        })
    }
}

/// Encode a complete datagram: header plus payload
pub fn encode_datagram(sender_port: u16, payload: &[u8], buf: &mut BytesMut) {
    let header = DatagramHeader {
        sender_port,
        payload_len: payload.len() as u16,
    };
    header.encode(buf);
    buf.put_slice(payload);
}

/// Decode a complete datagram, returning the header and payload
pub fn decode_datagram(buf: &mut Bytes) -> Result<(DatagramHeader, Bytes), crate::WireError> {
    let header = DatagramHeader::decode(buf)?;
    if buf.len() < header.payload_len as usize {
        return Err(crate::WireError::Truncated);
    }
    let payload = buf.split_to(header.payload_len as usize);
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_roundtrip() {
        let mut buf = BytesMut::new();
        encode_datagram(7355, b"fire and forget", &mut buf);
        assert_eq!(buf.len(), DATAGRAM_HEADER_SIZE + 15);

        let (header, payload) = decode_datagram(&mut buf.freeze()).unwrap();
        assert_eq!(header.sender_port, 7355);
        assert_eq!(&payload[..], b"fire and forget");
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = BytesMut::new();
        encode_datagram(7355, b"x", &mut buf);
        buf[0] = b'Z';

        assert_eq!(
            decode_datagram(&mut buf.freeze()),
            Err(crate::WireError::Magic)
        );
    }

    #[test]
    fn test_short_payload() {
        let mut buf = BytesMut::new();
        DatagramHeader {
            sender_port: 1,
            payload_len: 40,
        }
        .encode(&mut buf);
        buf.put_slice(b"only a little");

        assert_eq!(
            decode_datagram(&mut buf.freeze()),
            Err(crate::WireError::Truncated)
        );
    }
}

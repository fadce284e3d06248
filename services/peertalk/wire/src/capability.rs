//! Capability record processing for the wire protocol.
//!
//! Capabilities are exchanged once per connection as the TLV-encoded
//! payload of a Capability message. Unknown tags are length-prefixed and
//! skipped on decode, so older nodes interoperate with newer ones.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Smallest advertisable max message size
pub const MIN_ADVERTISED_MAX: u16 = 256;

/// Largest advertisable max message size
pub const MAX_ADVERTISED_MAX: u16 = 8192;

/// TLV tags for capability fields
mod tag {
    pub const MAX_MESSAGE_SIZE: u8 = 1;
    pub const PREFERRED_CHUNK: u8 = 2;
    pub const FLAGS: u8 = 3;
    pub const BUFFER_PRESSURE: u8 = 4;
}

bitflags! {
    /// Capability flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CapabilityFlags: u16 {
        /// Peer accepts fragmented messages
        const FRAGMENTATION = 0x0001;
        /// Peer accepts stream transfers
        const STREAMING = 0x0002;
    }
}

/// Negotiated per-peer parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Maximum efficient message size (256-8192, 0 = unknown)
    pub max_message_size: u16,
    /// Preferred streaming chunk size
    pub preferred_chunk: u16,
    /// Supported optional features
    pub flags: CapabilityFlags,
    /// Remote buffer pressure, 0-100
    pub buffer_pressure: u8,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_message_size: 0, // unknown until exchanged
            preferred_chunk: 1024,
            flags: CapabilityFlags::FRAGMENTATION,
            buffer_pressure: 0,
        }
    }
}

impl Capabilities {
    /// Encode the capability record as TLV
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(tag::MAX_MESSAGE_SIZE);
        buf.put_u8(2);
        buf.put_u16(self.max_message_size);

        buf.put_u8(tag::PREFERRED_CHUNK);
        buf.put_u8(2);
        buf.put_u16(self.preferred_chunk);

        buf.put_u8(tag::FLAGS);
        buf.put_u8(2);
        buf.put_u16(self.flags.bits());

        buf.put_u8(tag::BUFFER_PRESSURE);
        buf.put_u8(1);
        buf.put_u8(self.buffer_pressure);
    }

    /// Decode a TLV capability record, skipping unknown tags
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        let mut caps = Self {
            max_message_size: 0,
            preferred_chunk: 0,
            flags: CapabilityFlags::empty(),
            buffer_pressure: 0,
        };

        while !buf.is_empty() {
            if buf.len() < 2 {
                return Err(crate::WireError::Truncated);
            }
            let t = buf.get_u8();
            let len = buf.get_u8() as usize;
            if buf.len() < len {
                return Err(crate::WireError::Truncated);
            }
            let mut value = buf.split_to(len);

            match (t, len) {
                (tag::MAX_MESSAGE_SIZE, 2) => {
                    let max = value.get_u16();
                    if max != 0 && !(MIN_ADVERTISED_MAX..=MAX_ADVERTISED_MAX).contains(&max) {
                        return Err(crate::WireError::Size(max as usize));
                    }
                    caps.max_message_size = max;
                }
                (tag::PREFERRED_CHUNK, 2) => caps.preferred_chunk = value.get_u16(),
                (tag::FLAGS, 2) => {
                    caps.flags = CapabilityFlags::from_bits_truncate(value.get_u16())
                }
                (tag::BUFFER_PRESSURE, 1) => {
                    let pressure = value.get_u8();
                    if pressure > 100 {
                        return Err(crate::WireError::Malformed);
                    }
                    caps.buffer_pressure = pressure;
                }
                (tag::MAX_MESSAGE_SIZE | tag::PREFERRED_CHUNK | tag::FLAGS
                    | tag::BUFFER_PRESSURE, _) => {
                    return Err(crate::WireError::Malformed);
                }
                _ => {} // unknown tag, skip
            }
        }

        Ok(caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_roundtrip() {
        let caps = Capabilities {
            max_message_size: 4096,
            preferred_chunk: 1024,
            flags: CapabilityFlags::FRAGMENTATION | CapabilityFlags::STREAMING,
            buffer_pressure: 42,
        };

        let mut buf = BytesMut::new();
        caps.encode(&mut buf);

        let decoded = Capabilities::decode(&mut buf.freeze()).unwrap();
        assert_eq!(caps, decoded);
    }

    #[test]
    fn test_unknown_tags_skipped() {
        let caps = Capabilities {
            max_message_size: 2048,
            preferred_chunk: 512,
            flags: CapabilityFlags::FRAGMENTATION,
            buffer_pressure: 0,
        };

        let mut buf = BytesMut::new();
        // Future extension before the known fields
        buf.put_u8(0x7E);
        buf.put_u8(4);
        buf.put_u32(0xDEADBEEF);
        caps.encode(&mut buf);

        let decoded = Capabilities::decode(&mut buf.freeze()).unwrap();
        assert_eq!(caps, decoded);
    }

    #[test]
    fn test_out_of_range_max_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u8(2);
        buf.put_u16(100); // below the 256 floor

        assert_eq!(
            Capabilities::decode(&mut buf.freeze()),
            Err(crate::WireError::Size(100))
        );
    }

    #[test]
    fn test_truncated_value() {
        let mut buf = BytesMut::new();
        buf.put_u8(2);
        buf.put_u8(2);
        buf.put_u8(0x04); // one byte short

        assert_eq!(
            Capabilities::decode(&mut buf.freeze()),
            Err(crate::WireError::Truncated)
        );
    }

    #[test]
    fn test_pressure_over_100_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(4);
        buf.put_u8(1);
        buf.put_u8(101);

        assert_eq!(
            Capabilities::decode(&mut buf.freeze()),
            Err(crate::WireError::Malformed)
        );
    }
}

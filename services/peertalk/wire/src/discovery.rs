//! Discovery packet processing for the wire protocol.
//!
//! Discovery packets are broadcast over the unreliable transport to
//! announce presence, query for peers, and signal departure. They carry
//! the sender's listening port, its available transports, and a short
//! display name, trailed by a CRC-16 over everything before the trailer.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::checksum::crc16;
use crate::message::PROTOCOL_VERSION;

/// Discovery packet magic
pub const DISCOVERY_MAGIC: [u8; 4] = *b"PTLK";

/// Maximum peer name length in bytes
pub const MAX_NAME_LEN: usize = 31;

/// Minimum discovery packet size (empty name)
pub const DISCOVERY_MIN_SIZE: usize = 14;

/// Maximum discovery packet size (full name)
pub const DISCOVERY_MAX_SIZE: usize = DISCOVERY_MIN_SIZE + MAX_NAME_LEN;

/// Fixed header bytes before the name field
const DISCOVERY_HEADER_SIZE: usize = 12;

/// Discovery packet types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryType {
    /// Periodic presence announcement
    Announce = 0x01,
    /// Request for announcements from listening peers
    Query = 0x02,
    /// Graceful departure notification
    Goodbye = 0x03,
}

impl TryFrom<u8> for DiscoveryType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(DiscoveryType::Announce),
            0x02 => Ok(DiscoveryType::Query),
            0x03 => Ok(DiscoveryType::Goodbye),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Discovery flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DiscoveryFlags: u16 {
        /// Sender is hosting a session
        const HOST = 0x0001;
        /// Sender accepts new connections
        const ACCEPTING = 0x0002;
        /// Sender is observing only
        const SPECTATOR = 0x0004;
        /// Sender is ready to start
        const READY = 0x0008;
    }
}

bitflags! {
    /// Transports the sender can accept connections on
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TransportMask: u8 {
        /// Reliable stream transport
        const TCP = 0x01;
        /// Unreliable datagram transport
        const UDP = 0x02;
    }
}

/// Discovery packet structure (14-45 bytes on the wire)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPacket {
    /// Packet type
    pub typ: DiscoveryType,
    /// Sender status flags
    pub flags: DiscoveryFlags,
    /// Port the sender listens on for connections
    pub sender_port: u16,
    /// Transports the sender supports
    pub transports: TransportMask,
    /// Sender display name (at most [`MAX_NAME_LEN`] bytes)
    pub name: String,
}

impl DiscoveryPacket {
    /// Create an announce packet
    pub fn announce(sender_port: u16, transports: TransportMask, name: &str) -> Self {
        Self {
            typ: DiscoveryType::Announce,
            flags: DiscoveryFlags::ACCEPTING,
            sender_port,
            transports,
            name: name.to_string(),
        }
    }

    /// Encode the discovery packet with its CRC-16 trailer
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), crate::WireError> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(crate::WireError::NameLength(self.name.len()));
        }

        let start = buf.len();
        buf.put_slice(&DISCOVERY_MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.typ as u8);
        buf.put_u16(self.flags.bits());
        buf.put_u16(self.sender_port);
        buf.put_u8(self.transports.bits());
        buf.put_u8(self.name.len() as u8);
        buf.put_slice(self.name.as_bytes());
        let crc = crc16(&buf[start..]);
        buf.put_u16(crc);

        Ok(())
    }

    /// Decode and validate a discovery packet
    ///
    /// Validation order: minimum length, magic, version, type, name
    /// length, full length, CRC. Each failure maps to a distinct error
    /// and rejects the packet whole.
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < DISCOVERY_MIN_SIZE {
            return Err(crate::WireError::Truncated);
        }
        if buf[..4] != DISCOVERY_MAGIC {
            return Err(crate::WireError::Magic);
        }
        if buf[4] != PROTOCOL_VERSION {
            return Err(crate::WireError::Version(buf[4]));
        }
        let typ = DiscoveryType::try_from(buf[5])?;

        let name_len = buf[11] as usize;
        if name_len > MAX_NAME_LEN {
            return Err(crate::WireError::NameLength(name_len));
        }

        let total = DISCOVERY_HEADER_SIZE + name_len + 2;
        if buf.len() < total {
            return Err(crate::WireError::Truncated);
        }

        let actual = crc16(&buf[..total - 2]);
        let expected = u16::from_be_bytes([buf[total - 2], buf[total - 1]]);
        if actual != expected {
            return Err(crate::WireError::Crc { expected, actual });
        }

        buf.advance(6);
        let flags = DiscoveryFlags::from_bits_truncate(buf.get_u16());
        let sender_port = buf.get_u16();
        let transports = TransportMask::from_bits_truncate(buf.get_u8());
        buf.advance(1); // name_len, already read
        let name_bytes = buf.split_to(name_len);
        buf.advance(2); // crc trailer

        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|_| crate::WireError::Malformed)?;

        Ok(Self {
            typ,
            flags,
            sender_port,
            transports,
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_type_conversion() {
        assert_eq!(DiscoveryType::try_from(0x01).unwrap(), DiscoveryType::Announce);
        assert_eq!(DiscoveryType::try_from(0x03).unwrap(), DiscoveryType::Goodbye);
        assert!(DiscoveryType::try_from(0x00).is_err());
        assert!(DiscoveryType::try_from(0x04).is_err());
    }

    #[test]
    fn test_announce_roundtrip() {
        let packet = DiscoveryPacket::announce(
            7354,
            TransportMask::TCP | TransportMask::UDP,
            "workshop-mac",
        );

        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), DISCOVERY_MIN_SIZE + packet.name.len());

        let mut bytes = buf.freeze();
        let decoded = DiscoveryPacket::decode(&mut bytes).unwrap();
        assert_eq!(packet, decoded);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_empty_name_is_minimum_size() {
        let packet = DiscoveryPacket::announce(7354, TransportMask::TCP, "");
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), DISCOVERY_MIN_SIZE);

        let decoded = DiscoveryPacket::decode(&mut buf.freeze()).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn test_name_too_long_rejected() {
        let packet = DiscoveryPacket::announce(7354, TransportMask::TCP, &"x".repeat(32));
        let mut buf = BytesMut::new();
        assert_eq!(
            packet.encode(&mut buf),
            Err(crate::WireError::NameLength(32))
        );
    }

    #[test]
    fn test_validation_order() {
        let packet = DiscoveryPacket::announce(7354, TransportMask::TCP, "peer");
        let mut good = BytesMut::new();
        packet.encode(&mut good).unwrap();

        // Too short
        let mut short = Bytes::from_static(b"PTLK");
        assert_eq!(
            DiscoveryPacket::decode(&mut short),
            Err(crate::WireError::Truncated)
        );

        // Bad magic
        let mut bad = good.clone();
        bad[0] = b'Q';
        assert_eq!(
            DiscoveryPacket::decode(&mut bad.freeze()),
            Err(crate::WireError::Magic)
        );

        // Bad version (checked before CRC, so no need to re-seal)
        let mut bad = good.clone();
        bad[4] = 9;
        assert_eq!(
            DiscoveryPacket::decode(&mut bad.freeze()),
            Err(crate::WireError::Version(9))
        );

        // Bad type
        let mut bad = good.clone();
        bad[5] = 0x7F;
        assert_eq!(
            DiscoveryPacket::decode(&mut bad.freeze()),
            Err(crate::WireError::Type(0x7F))
        );

        // Corrupted name byte fails the CRC
        let mut bad = good.clone();
        bad[12] ^= 0x01;
        assert!(matches!(
            DiscoveryPacket::decode(&mut bad.freeze()),
            Err(crate::WireError::Crc { .. })
        ));
    }
}

//! Wire protocol framing, encoding/decoding, and checksums for peertalk.
//!
//! This crate provides the binary wire protocol shared by every peertalk
//! transport: discovery packets, message frames, fragment headers,
//! capability records, and unreliable datagrams. All records are fixed
//! byte layouts with big-endian integers and (where noted) a CRC-16
//! trailer, so the same bytes interoperate across hosts regardless of
//! native byte order or word size.
//!
//! ## Features
//!
//! - **Fixed Layouts**: 10-byte message header, 8-byte fragment header
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for minimal allocations
//! - **CRC-16 Trailers**: KERMIT polynomial, check value 0x2189
//! - **Capability TLV**: Forward-compatible tag/length/value records
//!
//! ## Message Frame Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | magic "PTMG" (4B)    | frame magic                |
//! +----------------------+----------------------------+
//! | version (1B)         | protocol version (1)       |
//! +----------------------+----------------------------+
//! | type (1B)            | data/ping/pong/...         |
//! +----------------------+----------------------------+
//! | flags (1B)           | unreliable/batch/fragment..|
//! +----------------------+----------------------------+
//! | sequence (1B)        | per-peer wrapping counter  |
//! +----------------------+----------------------------+
//! | payload_len (2B)     | length of payload bytes    |
//! +----------------------+----------------------------+
//! | payload              | variable (0..65535)        |
//! +----------------------+----------------------------+
//! | crc16 (2B)           | covers header + payload    |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capability;
pub mod checksum;
pub mod datagram;
pub mod discovery;
pub mod error;
pub mod fragment;
pub mod message;

// Re-export main types
pub use capability::{Capabilities, CapabilityFlags, MAX_ADVERTISED_MAX, MIN_ADVERTISED_MAX};
pub use checksum::{crc16, crc16_parts};
pub use datagram::{
    decode_datagram, encode_datagram, DatagramHeader, DATAGRAM_HEADER_SIZE, DATAGRAM_MAGIC,
};
pub use discovery::{
    DiscoveryFlags, DiscoveryPacket, DiscoveryType, TransportMask, DISCOVERY_MAGIC,
    DISCOVERY_MAX_SIZE, DISCOVERY_MIN_SIZE, MAX_NAME_LEN,
};
pub use error::WireError;
pub use fragment::{FragFlags, FragmentHeader, FRAGMENT_HEADER_SIZE};
pub use message::{
    decode_frame, encode_batch_entry, encode_frame, BatchIter, MsgFlags, MsgHeader, MsgType,
    BATCH_ENTRY_HEADER_SIZE, MAX_PAYLOAD_SIZE, MESSAGE_MAGIC, MSG_HEADER_SIZE, PROTOCOL_VERSION,
};

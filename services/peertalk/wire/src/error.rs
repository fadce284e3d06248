//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete record (need more data)
    #[error("truncated record")]
    Truncated,

    /// Wrong magic value
    #[error("bad magic")]
    Magic,

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Unknown record type
    #[error("unknown type {0}")]
    Type(u8),

    /// Checksum mismatch
    #[error("crc mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Crc {
        /// CRC carried on the wire
        expected: u16,
        /// CRC computed over the received bytes
        actual: u16,
    },

    /// Peer name longer than the wire limit
    #[error("name too long: {0}")]
    NameLength(usize),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Malformed record structure
    #[error("malformed record")]
    Malformed,
}

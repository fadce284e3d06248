//! Transport abstraction supplied by the embedder.

use thiserror::Error;

use peertalk_peer::PeerId;

/// Transport-level failures reported back to the engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// Transport cannot take more bytes right now
    #[error("transport would block")]
    WouldBlock,

    /// Operation not offered by this backend
    #[error("transport operation unsupported")]
    Unsupported,

    /// Connection is gone
    #[error("transport closed")]
    Closed,

    /// Any other transport failure
    #[error("transport failure: {0}")]
    Transport(String),
}

/// The few operations the engine needs from a transport backend
///
/// Implementations exist per platform (POSIX sockets, serial links,
/// test doubles); the engine holds one as a trait object and never
/// branches on the backend type.
pub trait Platform {
    /// Send bytes over the reliable transport to a connected peer
    fn send(&mut self, peer: PeerId, bytes: &[u8]) -> Result<(), PlatformError>;

    /// Send bytes over the unreliable datagram transport
    fn send_unreliable(&mut self, peer: PeerId, bytes: &[u8]) -> Result<(), PlatformError>;

    /// Current monotonic tick value in milliseconds (wrapping)
    fn ticks(&self) -> u32;
}

//! Engine error types.

use thiserror::Error;

use crate::platform::PlatformError;

/// Engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Wire protocol failure
    #[error(transparent)]
    Wire(#[from] peertalk_wire::WireError),

    /// Buffering failure
    #[error(transparent)]
    Queue(#[from] peertalk_queue::QueueError),

    /// Peer management failure
    #[error(transparent)]
    Peer(#[from] peertalk_peer::PeerError),

    /// Transport failure
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// Operation requires a connected peer
    #[error("peer {0} not connected")]
    NotConnected(u16),

    /// Payload exceeds every available path
    #[error("message too large: {0}")]
    TooLarge(usize),

    /// Peer already has an operation of this kind in flight
    #[error("peer {0} busy")]
    Busy(u16),

    /// Negotiated maximum leaves no useful fragment capacity
    #[error("effective max {0} too small to fragment")]
    EffectiveMaxTooSmall(u16),
}

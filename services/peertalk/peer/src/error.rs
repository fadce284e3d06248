//! Peer management error types.

use thiserror::Error;

use crate::state::PeerState;

/// Peer management errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerError {
    /// Transition not permitted by the lifecycle state machine
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the peer was in
        from: PeerState,
        /// State that was requested
        to: PeerState,
    },

    /// No peer with the given identifier
    #[error("peer {0} not found")]
    NotFound(u16),

    /// Registry is full
    #[error("no free peer slot")]
    NoFreeSlot,

    /// Operation requires a connected peer
    #[error("peer {0} not connected")]
    NotConnected(u16),

    /// Fragment does not belong to the in-progress reassembly
    #[error("reassembly id mismatch: active {active}, got {got}")]
    ReassemblyMismatch {
        /// Message id currently being reassembled
        active: u16,
        /// Message id carried by the rejected fragment
        got: u16,
    },

    /// Fragment exceeds the declared total length
    #[error("fragment past declared total")]
    ReassemblyOverflow,

    /// Fragment disagrees about the total message length
    #[error("reassembly length mismatch: declared {expected}, got {got}")]
    ReassemblyLengthMismatch {
        /// Total length declared by the FIRST fragment
        expected: u16,
        /// Total length carried by the rejected fragment
        got: u16,
    },

    /// Fragment arrived out of order
    #[error("fragment out of order: expected offset {expected}, got {got}")]
    ReassemblyOutOfOrder {
        /// Offset the tracker expected next
        expected: u16,
        /// Offset carried by the rejected fragment
        got: u16,
    },

    /// No reassembly in progress for a non-first fragment
    #[error("fragment without an active reassembly")]
    ReassemblyInactive,

    /// Peer name longer than the wire limit
    #[error("name too long: {0}")]
    NameTooLong(usize),

    /// Underlying buffering error
    #[error(transparent)]
    Queue(#[from] peertalk_queue::QueueError),
}

//! Buffering error types.

use thiserror::Error;

use crate::slot_queue::Backpressure;

/// Buffering errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// No free slot available
    #[error("queue full")]
    Full,

    /// No message to pop
    #[error("queue empty")]
    Empty,

    /// Payload exceeds the slot or buffer capacity
    #[error("message too large: {0}")]
    TooLarge(usize),

    /// Buffer busy with a previous message
    #[error("would block")]
    WouldBlock,

    /// Rejected by the backpressure policy
    #[error("rejected under {0:?} backpressure")]
    Backpressure(Backpressure),

    /// Capacity must be a power of two
    #[error("capacity not a power of two: {0}")]
    NotPowerOfTwo(usize),

    /// Operation not legal in the buffer's current state
    #[error("wrong buffer state")]
    State,
}

//! Tier 2 direct buffer for large messages.
//!
//! One buffer per peer per direction stages a single message too large
//! for a queue slot. Pre-allocating it at construction keeps memory use
//! predictable and avoids fragmentation on constrained hosts.

use serde::{Deserialize, Serialize};

use crate::{Priority, QueueError};

/// Default direct buffer capacity in bytes
pub const DIRECT_DEFAULT_SIZE: usize = 4096;

/// Maximum direct buffer capacity in bytes
pub const DIRECT_MAX_SIZE: usize = 8192;

/// Direct buffer lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectState {
    /// Empty, acceptable to fill
    Idle,
    /// Filled, awaiting transmission
    Queued,
    /// Handed to the transport
    Sending,
}

/// Single-message staging buffer
pub struct DirectBuffer {
    data: Box<[u8]>,
    len: usize,
    state: DirectState,
    priority: Priority,
    msg_flags: u8,
}

impl DirectBuffer {
    /// Create a buffer with the given capacity (0 selects the default)
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        let capacity = if capacity == 0 {
            DIRECT_DEFAULT_SIZE
        } else {
            capacity
        };
        if capacity > DIRECT_MAX_SIZE {
            return Err(QueueError::TooLarge(capacity));
        }

        Ok(Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            state: DirectState::Idle,
            priority: Priority::Normal,
            msg_flags: 0,
        })
    }

    /// Buffer capacity in bytes
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Current state
    pub fn state(&self) -> DirectState {
        self.state
    }

    /// True when a message is staged and awaiting transmission
    pub fn is_ready(&self) -> bool {
        self.state == DirectState::Queued
    }

    /// True when the buffer can accept a new message
    pub fn is_available(&self) -> bool {
        self.state == DirectState::Idle
    }

    /// Stage a message for transmission, Idle -> Queued
    pub fn queue(&mut self, data: &[u8], priority: Priority) -> Result<(), QueueError> {
        if self.state != DirectState::Idle {
            return Err(QueueError::WouldBlock);
        }
        if data.len() > self.data.len() {
            return Err(QueueError::TooLarge(data.len()));
        }

        self.data[..data.len()].copy_from_slice(data);
        self.len = data.len();
        self.priority = priority;
        self.msg_flags = 0;

        // State write last so a reader polling is_ready never sees a
        // half-copied payload.
        self.state = DirectState::Queued;
        Ok(())
    }

    /// Override the message flags carried to the drain path
    ///
    /// The fragment path uses this to mark staged payloads as fragments.
    pub fn set_msg_flags(&mut self, flags: u8) {
        self.msg_flags = flags;
    }

    /// Message flags carried with the staged payload
    pub fn msg_flags(&self) -> u8 {
        self.msg_flags
    }

    /// Priority of the staged payload
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Staged payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Hand the staged message to the transport, Queued -> Sending
    pub fn mark_sending(&mut self) -> Result<(), QueueError> {
        if self.state != DirectState::Queued {
            return Err(QueueError::State);
        }
        self.state = DirectState::Sending;
        Ok(())
    }

    /// Return to Idle unconditionally
    ///
    /// Called whether the transmission succeeded or failed, so a failed
    /// send never wedges the buffer.
    pub fn complete(&mut self) {
        self.len = 0;
        self.state = DirectState::Idle;
    }

    /// Accept an inbound payload for immediate delivery
    ///
    /// The receive path tracks no state: data lands here only long
    /// enough to be handed to the application or the reassembler.
    pub fn receive(&mut self, data: &[u8]) -> Result<(), QueueError> {
        if data.len() > self.data.len() {
            return Err(QueueError::TooLarge(data.len()));
        }
        self.data[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }

    /// Write an inbound fragment at the given offset
    pub fn receive_at(&mut self, offset: usize, data: &[u8]) -> Result<(), QueueError> {
        let end = offset + data.len();
        if end > self.data.len() {
            return Err(QueueError::TooLarge(end));
        }
        self.data[offset..end].copy_from_slice(data);
        if end > self.len {
            self.len = end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_defaults_and_limit() {
        assert_eq!(DirectBuffer::new(0).unwrap().capacity(), DIRECT_DEFAULT_SIZE);
        assert_eq!(DirectBuffer::new(8192).unwrap().capacity(), DIRECT_MAX_SIZE);
        assert!(matches!(
            DirectBuffer::new(DIRECT_MAX_SIZE + 1),
            Err(QueueError::TooLarge(_))
        ));
    }

    #[test]
    fn test_lifecycle() {
        let mut buf = DirectBuffer::new(1024).unwrap();
        assert!(buf.is_available());
        assert!(!buf.is_ready());

        buf.queue(b"a large payload", Priority::High).unwrap();
        assert!(buf.is_ready());
        assert_eq!(buf.payload(), b"a large payload");
        assert_eq!(buf.priority(), Priority::High);

        // Second producer must wait
        assert!(matches!(
            buf.queue(b"another", Priority::Normal),
            Err(QueueError::WouldBlock)
        ));

        buf.mark_sending().unwrap();
        assert!(matches!(buf.mark_sending(), Err(QueueError::State)));

        buf.complete();
        assert!(buf.is_available());
        buf.queue(b"next", Priority::Normal).unwrap();
    }

    #[test]
    fn test_complete_recovers_failed_send() {
        let mut buf = DirectBuffer::new(256).unwrap();
        buf.queue(b"doomed", Priority::Normal).unwrap();
        buf.mark_sending().unwrap();
        // Transport reported failure; complete() still resets.
        buf.complete();
        assert!(buf.is_available());
    }

    #[test]
    fn test_too_large() {
        let mut buf = DirectBuffer::new(64).unwrap();
        let big = [0u8; 65];
        assert!(matches!(
            buf.queue(&big, Priority::Normal),
            Err(QueueError::TooLarge(65))
        ));
        assert!(buf.is_available());
    }

    #[test]
    fn test_receive_at_assembles_offsets() {
        let mut buf = DirectBuffer::new(64).unwrap();
        buf.receive_at(0, b"hello ").unwrap();
        buf.receive_at(6, b"world").unwrap();
        assert_eq!(buf.payload(), b"hello world");

        assert!(matches!(
            buf.receive_at(60, b"overrun"),
            Err(QueueError::TooLarge(_))
        ));
    }
}

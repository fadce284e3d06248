//! Inbound fragment reassembly tracking.
//!
//! One message may be reassembled at a time per peer per direction.
//! The tracker accounts for lengths and ordering; the fragment bytes
//! themselves land in the peer's receive direct buffer at the offsets
//! the fragment headers declare.

use peertalk_wire::{FragFlags, FragmentHeader};

use crate::PeerError;

/// Per-peer, per-direction reassembly bookkeeping
#[derive(Debug, Clone, Copy, Default)]
pub struct ReassemblyState {
    active: bool,
    message_id: u16,
    total_len: u16,
    received: u16,
}

impl ReassemblyState {
    /// Create an inactive tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a reassembly is in progress
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Message id currently being reassembled
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// Declared total length of the message in progress
    pub fn total_len(&self) -> u16 {
        self.total_len
    }

    /// Bytes accounted for so far
    pub fn received(&self) -> u16 {
        self.received
    }

    /// Abandon any reassembly in progress
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Account for one fragment; returns true when the message is whole
    ///
    /// A FIRST fragment starts a new reassembly and is rejected while
    /// another is active. Later fragments must carry the active message
    /// id and total length and arrive in offset order. Completion requires a LAST
    /// fragment that brings the received length exactly to the declared
    /// total; the tracker then resets itself.
    pub fn accept(&mut self, header: &FragmentHeader, payload_len: usize) -> Result<bool, PeerError> {
        if header.flags.contains(FragFlags::FIRST) {
            if self.active {
                return Err(PeerError::ReassemblyMismatch {
                    active: self.message_id,
                    got: header.message_id,
                });
            }
            if header.offset != 0 {
                return Err(PeerError::ReassemblyOutOfOrder {
                    expected: 0,
                    got: header.offset,
                });
            }
            self.active = true;
            self.message_id = header.message_id;
            self.total_len = header.total_len;
            self.received = 0;
        } else {
            if !self.active {
                return Err(PeerError::ReassemblyInactive);
            }
            if header.message_id != self.message_id {
                return Err(PeerError::ReassemblyMismatch {
                    active: self.message_id,
                    got: header.message_id,
                });
            }
            if header.total_len != self.total_len {
                return Err(PeerError::ReassemblyLengthMismatch {
                    expected: self.total_len,
                    got: header.total_len,
                });
            }
            if header.offset != self.received {
                return Err(PeerError::ReassemblyOutOfOrder {
                    expected: self.received,
                    got: header.offset,
                });
            }
        }

        let end = header.offset as usize + payload_len;
        if end > self.total_len as usize {
            self.reset();
            return Err(PeerError::ReassemblyOverflow);
        }
        self.received = end as u16;

        if header.flags.contains(FragFlags::LAST) && self.received == self.total_len {
            self.reset();
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(id: u16, total: u16, offset: u16, flags: FragFlags) -> FragmentHeader {
        FragmentHeader::new(id, total, offset, flags)
    }

    #[test]
    fn test_in_order_reassembly() {
        let mut r = ReassemblyState::new();
        assert!(!r.accept(&frag(7, 300, 0, FragFlags::FIRST), 100).unwrap());
        assert_eq!(r.received(), 100);
        assert!(!r.accept(&frag(7, 300, 100, FragFlags::empty()), 100).unwrap());
        assert!(r.accept(&frag(7, 300, 200, FragFlags::LAST), 100).unwrap());
        assert!(!r.is_active());
    }

    #[test]
    fn test_mismatched_id_rejected() {
        let mut r = ReassemblyState::new();
        r.accept(&frag(7, 300, 0, FragFlags::FIRST), 100).unwrap();

        assert_eq!(
            r.accept(&frag(8, 300, 100, FragFlags::empty()), 100),
            Err(PeerError::ReassemblyMismatch { active: 7, got: 8 })
        );
        // The in-progress reassembly survives the bad fragment
        assert!(r.is_active());
        assert_eq!(r.message_id(), 7);
    }

    #[test]
    fn test_first_while_active_rejected() {
        let mut r = ReassemblyState::new();
        r.accept(&frag(7, 300, 0, FragFlags::FIRST), 100).unwrap();
        assert!(matches!(
            r.accept(&frag(9, 200, 0, FragFlags::FIRST), 50),
            Err(PeerError::ReassemblyMismatch { active: 7, got: 9 })
        ));
    }

    #[test]
    fn test_lying_total_len_rejected() {
        let mut r = ReassemblyState::new();
        r.accept(&frag(7, 3000, 0, FragFlags::FIRST), 1000).unwrap();

        // Mid-sequence fragment claims a different message total
        assert_eq!(
            r.accept(&frag(7, 5000, 1000, FragFlags::empty()), 1000),
            Err(PeerError::ReassemblyLengthMismatch {
                expected: 3000,
                got: 5000
            })
        );
    }

    #[test]
    fn test_out_of_order_never_completes() {
        let mut r = ReassemblyState::new();
        r.accept(&frag(7, 200, 0, FragFlags::FIRST), 100).unwrap();
        assert_eq!(
            r.accept(&frag(7, 200, 150, FragFlags::LAST), 50),
            Err(PeerError::ReassemblyOutOfOrder {
                expected: 100,
                got: 150
            })
        );
    }

    #[test]
    fn test_fragment_without_begin() {
        let mut r = ReassemblyState::new();
        assert_eq!(
            r.accept(&frag(7, 200, 0, FragFlags::empty()), 100),
            Err(PeerError::ReassemblyInactive)
        );
    }

    #[test]
    fn test_overflow_aborts() {
        let mut r = ReassemblyState::new();
        r.accept(&frag(7, 150, 0, FragFlags::FIRST), 100).unwrap();
        assert_eq!(
            r.accept(&frag(7, 150, 100, FragFlags::LAST), 100),
            Err(PeerError::ReassemblyOverflow)
        );
        assert!(!r.is_active());
    }

    #[test]
    fn test_last_short_of_total_stalls() {
        let mut r = ReassemblyState::new();
        r.accept(&frag(7, 300, 0, FragFlags::FIRST), 100).unwrap();
        // LAST arrives but lengths do not add up; no completion signal
        assert!(!r.accept(&frag(7, 300, 100, FragFlags::LAST), 100).unwrap());
        assert!(r.is_active());
    }
}

//! Peer lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Peer lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerState {
    /// Slot not in use
    Unused,
    /// Seen in discovery, no transport yet
    Discovered,
    /// Connection attempt in flight
    Connecting,
    /// Transport established
    Connected,
    /// Graceful close in progress
    Disconnecting,
    /// Connection attempt or transport failed
    Failed,
}

impl PeerState {
    /// Whether the lifecycle permits moving from `self` to `next`
    ///
    /// Every state may force-reset to Unused. Failed -> Discovered is
    /// the recovery path for a peer that reappears in discovery after a
    /// connection failure.
    pub fn can_transition_to(self, next: PeerState) -> bool {
        use PeerState::*;

        if next == Unused {
            return true;
        }
        matches!(
            (self, next),
            (Unused, Discovered)
                | (Discovered, Connecting)
                | (Discovered, Connected)
                | (Discovered, Discovered)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Disconnecting)
                | (Connected, Failed)
                | (Failed, Discovered)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PeerState::*;

    const ALL: [PeerState; 6] = [Unused, Discovered, Connecting, Connected, Disconnecting, Failed];

    #[test]
    fn test_full_transition_table() {
        let legal = [
            (Unused, Discovered),
            (Discovered, Connecting),
            (Discovered, Connected),
            (Discovered, Discovered),
            (Connecting, Connected),
            (Connecting, Failed),
            (Connected, Disconnecting),
            (Connected, Failed),
            (Failed, Discovered),
        ];

        for from in ALL {
            for to in ALL {
                let expected = to == Unused || legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "transition {from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn test_force_reset_always_legal() {
        for state in ALL {
            assert!(state.can_transition_to(Unused));
        }
    }

    #[test]
    fn test_no_reconnect_from_disconnecting() {
        assert!(!Disconnecting.can_transition_to(Connected));
        assert!(!Disconnecting.can_transition_to(Discovered));
    }
}

//! Peer registry, lifecycle state machine, and fragment reassembly.
//!
//! A peer record owns everything the transport needs for one remote
//! endpoint: its lifecycle state, negotiated capabilities, sequence
//! counters, send/receive slot queues, send/receive direct buffers, and
//! the reassembly tracker for inbound fragments. Records live in a
//! fixed-size registry allocated once at startup; identifiers are
//! stable for the registry's lifetime.

pub mod error;
pub mod reassembly;
pub mod registry;
pub mod state;

pub use error::PeerError;
pub use reassembly::ReassemblyState;
pub use registry::{ticks_since, Peer, PeerId, PeerRegistry, PeerStats, RTT_WINDOW};
pub use state::PeerState;

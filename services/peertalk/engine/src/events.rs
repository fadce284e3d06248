//! Events the engine reports to the embedding application.

use std::net::SocketAddr;

use bytes::Bytes;

use peertalk_peer::PeerId;

/// Application-visible engine activity
///
/// Events are queued inside the engine and drained by
/// [`crate::Engine::poll`]; they surface only from the main loop, never
/// from interrupt context.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A previously unknown peer appeared in discovery
    PeerDiscovered {
        /// Registry identifier of the new peer
        peer: PeerId,
    },
    /// A peer reached the Connected state
    PeerConnected {
        /// Registry identifier
        peer: PeerId,
    },
    /// A peer disconnected gracefully
    PeerDisconnected {
        /// Identifier the peer had; its slot is recycled
        peer: PeerId,
    },
    /// A peer timed out or said goodbye
    PeerLost {
        /// Identifier the peer had; its slot is recycled
        peer: PeerId,
    },
    /// A complete message arrived (reassembled and de-batched)
    MessageReceived {
        /// Sending peer
        peer: PeerId,
        /// Message payload
        payload: Bytes,
    },
    /// An unreliable datagram arrived
    DatagramReceived {
        /// Sending peer, when the source address is known
        peer: Option<PeerId>,
        /// Datagram payload
        payload: Bytes,
    },
    /// A discovery query arrived; the embedder should answer with an
    /// announce packet
    DiscoveryQuery {
        /// Address that asked
        from: SocketAddr,
    },
    /// Bytes left for a peer over the reliable transport
    MessageSent {
        /// Destination peer
        peer: PeerId,
        /// Wire bytes written, framing included
        bytes: usize,
    },
    /// A send attempt failed after being accepted
    SendFailed {
        /// Destination peer
        peer: PeerId,
        /// What went wrong
        error: crate::EngineError,
    },
    /// A stream transfer finished
    StreamComplete {
        /// Destination peer
        peer: PeerId,
        /// Total bytes delivered
        bytes: usize,
    },
    /// A stream transfer was cancelled by the sender
    StreamCancelled {
        /// Destination peer
        peer: PeerId,
        /// Bytes delivered before cancellation
        bytes_sent: usize,
    },
    /// A stream transfer failed mid-flight
    StreamFailed {
        /// Destination peer
        peer: PeerId,
        /// Bytes delivered before the failure
        bytes_sent: usize,
        /// What went wrong
        error: crate::EngineError,
    },
}

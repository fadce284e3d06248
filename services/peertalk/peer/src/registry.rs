//! Fixed-size peer table with stable identifiers.
//!
//! Slots, their queues, and their direct buffers are all allocated when
//! the registry is built; creating and destroying peers only claims and
//! recycles slots. Identifiers are 1-based slot positions (0 is
//! reserved for "self"), so destroying one peer never renumbers the
//! others.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use peertalk_queue::{DirectBuffer, SlotQueue};
use peertalk_wire::{Capabilities, MAX_NAME_LEN};

use crate::reassembly::ReassemblyState;
use crate::state::PeerState;
use crate::PeerError;

/// Peer identifier; 1-based, 0 reserved for the local node
pub type PeerId = u16;

/// Round-trip-time samples kept per peer
pub const RTT_WINDOW: usize = 8;

/// Signed tick distance from `then` to `now`
///
/// Wrapping subtraction interpreted as signed, so timeout checks keep
/// working across counter wraparound.
pub fn ticks_since(now: u32, then: u32) -> i32 {
    now.wrapping_sub(then) as i32
}

/// Per-peer traffic counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PeerStats {
    /// Messages handed to the transport
    pub messages_sent: u64,
    /// Messages delivered to the application
    pub messages_received: u64,
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Payload bytes received
    pub bytes_received: u64,
    /// Transport send failures
    pub send_errors: u64,
}

/// One remote endpoint and everything the transport holds for it
pub struct Peer {
    id: PeerId,
    state: PeerState,
    addr: Option<SocketAddr>,
    name: String,
    last_seen: u32,
    send_seq: u8,
    recv_seq: u8,
    rtt_samples: [u32; RTT_WINDOW],
    rtt_count: usize,
    rtt_index: usize,
    caps: Capabilities,
    caps_sent: bool,
    effective_max: u16,
    /// Traffic counters
    pub stats: PeerStats,
    /// Tier 1 outbound queue
    pub send_queue: SlotQueue,
    /// Tier 1 inbound queue
    pub recv_queue: SlotQueue,
    /// Tier 2 outbound staging buffer
    pub send_buffer: DirectBuffer,
    /// Tier 2 inbound staging buffer, also reassembly scratch
    pub recv_buffer: DirectBuffer,
    /// Inbound fragment tracking
    pub reassembly: ReassemblyState,
}

impl Peer {
    fn new(id: PeerId, queue_capacity: usize, buffer_capacity: usize) -> Result<Self, PeerError> {
        Ok(Self {
            id,
            state: PeerState::Unused,
            addr: None,
            name: String::new(),
            last_seen: 0,
            send_seq: 0,
            recv_seq: 0,
            rtt_samples: [0; RTT_WINDOW],
            rtt_count: 0,
            rtt_index: 0,
            caps: Capabilities::default(),
            caps_sent: false,
            effective_max: 0,
            stats: PeerStats::default(),
            send_queue: SlotQueue::new(queue_capacity)?,
            recv_queue: SlotQueue::new(queue_capacity)?,
            send_buffer: DirectBuffer::new(buffer_capacity)?,
            recv_buffer: DirectBuffer::new(buffer_capacity)?,
            reassembly: ReassemblyState::new(),
        })
    }

    /// Stable peer identifier
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Network address, when known
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tick of the last observed activity
    pub fn last_seen(&self) -> u32 {
        self.last_seen
    }

    /// Record activity at the given tick
    pub fn touch(&mut self, now: u32) {
        self.last_seen = now;
    }

    /// Replace the display name
    pub fn set_name(&mut self, name: &str) -> Result<(), PeerError> {
        if name.len() > MAX_NAME_LEN {
            return Err(PeerError::NameTooLong(name.len()));
        }
        self.name.clear();
        self.name.push_str(name);
        Ok(())
    }

    /// Move to `next`, enforcing the lifecycle table
    ///
    /// An illegal transition leaves the state unchanged, logs a
    /// warning, and returns an error.
    pub fn transition(&mut self, next: PeerState) -> Result<(), PeerError> {
        if !self.state.can_transition_to(next) {
            warn!(
                peer = self.id,
                from = ?self.state,
                to = ?next,
                "rejected peer state transition"
            );
            return Err(PeerError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        if next == PeerState::Connected {
            info!(peer = self.id, name = %self.name, "peer connected");
        } else {
            debug!(peer = self.id, from = ?self.state, to = ?next, "peer state transition");
        }
        self.state = next;
        Ok(())
    }

    /// Next outbound frame sequence number (wrapping)
    pub fn next_send_seq(&mut self) -> u8 {
        let seq = self.send_seq;
        self.send_seq = self.send_seq.wrapping_add(1);
        seq
    }

    /// Record the sequence number of a received frame
    pub fn note_recv_seq(&mut self, seq: u8) {
        self.recv_seq = seq;
    }

    /// Sequence number of the last received frame
    pub fn recv_seq(&self) -> u8 {
        self.recv_seq
    }

    /// Add a round-trip-time sample in milliseconds
    pub fn record_rtt(&mut self, sample_ms: u32) {
        self.rtt_samples[self.rtt_index] = sample_ms;
        self.rtt_index = (self.rtt_index + 1) % RTT_WINDOW;
        if self.rtt_count < RTT_WINDOW {
            self.rtt_count += 1;
        }
    }

    /// Mean of the recorded round-trip-time samples
    pub fn average_rtt(&self) -> Option<u32> {
        if self.rtt_count == 0 {
            return None;
        }
        let sum: u64 = self.rtt_samples[..self.rtt_count]
            .iter()
            .map(|&s| s as u64)
            .sum();
        Some((sum / self.rtt_count as u64) as u32)
    }

    /// Remote capability record
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Install the remote capability record and cache the effective max
    ///
    /// The effective maximum is the smaller of the local and remote
    /// advertised limits; 0 (unknown) on either side leaves it unknown.
    pub fn set_remote_capabilities(&mut self, caps: Capabilities, local_max: u16) {
        self.effective_max = if caps.max_message_size == 0 || local_max == 0 {
            0
        } else {
            caps.max_message_size.min(local_max)
        };
        self.caps = caps;
    }

    /// Cached effective maximum message size (0 = not negotiated)
    pub fn effective_max(&self) -> u16 {
        self.effective_max
    }

    /// Whether the local capability record has been sent to this peer
    pub fn caps_sent(&self) -> bool {
        self.caps_sent
    }

    /// Record that the local capability record went out
    pub fn mark_caps_sent(&mut self) {
        self.caps_sent = true;
    }

    /// Whether the remote side accepts fragmented messages
    pub fn supports_fragmentation(&self) -> bool {
        self.caps
            .flags
            .contains(peertalk_wire::CapabilityFlags::FRAGMENTATION)
    }

    /// Whether the peer has been silent longer than `timeout_ticks`
    pub fn is_timed_out(&self, now: u32, timeout_ticks: u32) -> bool {
        ticks_since(now, self.last_seen) > timeout_ticks as i32
    }

    fn recycle(&mut self) {
        self.state = PeerState::Unused;
        self.addr = None;
        self.name.clear();
        self.last_seen = 0;
        self.send_seq = 0;
        self.recv_seq = 0;
        self.rtt_count = 0;
        self.rtt_index = 0;
        self.caps = Capabilities::default();
        self.caps_sent = false;
        self.effective_max = 0;
        self.stats = PeerStats::default();
        self.send_queue.clear();
        self.recv_queue.clear();
        self.send_buffer.complete();
        self.recv_buffer.complete();
        self.reassembly.reset();
    }
}

/// Fixed table of peer records
pub struct PeerRegistry {
    peers: Vec<Peer>,
}

impl PeerRegistry {
    /// Allocate a registry with `max_peers` slots
    ///
    /// Every slot's queues and buffers are built here; nothing
    /// allocates later.
    pub fn new(
        max_peers: usize,
        queue_capacity: usize,
        buffer_capacity: usize,
    ) -> Result<Self, PeerError> {
        let peers = (0..max_peers)
            .map(|idx| Peer::new((idx + 1) as PeerId, queue_capacity, buffer_capacity))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { peers })
    }

    /// Total slot count
    pub fn capacity(&self) -> usize {
        self.peers.len()
    }

    /// Number of slots currently in use
    pub fn live_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.state != PeerState::Unused)
            .count()
    }

    /// Create a peer, or refresh an existing one at the same address
    pub fn create(&mut self, addr: SocketAddr, name: &str, now: u32) -> Result<PeerId, PeerError> {
        if name.len() > MAX_NAME_LEN {
            return Err(PeerError::NameTooLong(name.len()));
        }

        if let Some(id) = self.find_by_addr(addr) {
            let peer = self.get_mut(id)?;
            peer.touch(now);
            if !name.is_empty() {
                peer.set_name(name)?;
            }
            debug!(peer = id, %addr, "refreshed existing peer");
            return Ok(id);
        }

        let peer = self
            .peers
            .iter_mut()
            .find(|p| p.state == PeerState::Unused)
            .ok_or(PeerError::NoFreeSlot)?;

        peer.addr = Some(addr);
        peer.set_name(name)?;
        peer.touch(now);
        peer.transition(PeerState::Discovered)?;
        debug!(peer = peer.id, %addr, name, "created peer");
        Ok(peer.id)
    }

    /// Recycle a peer slot; other identifiers are unaffected
    pub fn destroy(&mut self, id: PeerId) -> Result<(), PeerError> {
        let peer = self.get_mut(id)?;
        debug!(peer = id, "destroying peer");
        peer.recycle();
        Ok(())
    }

    /// Look up a live peer by identifier, O(1)
    pub fn get(&self, id: PeerId) -> Result<&Peer, PeerError> {
        self.peers
            .get(id.wrapping_sub(1) as usize)
            .filter(|p| p.state != PeerState::Unused)
            .ok_or(PeerError::NotFound(id))
    }

    /// Mutable lookup by identifier, O(1)
    pub fn get_mut(&mut self, id: PeerId) -> Result<&mut Peer, PeerError> {
        self.peers
            .get_mut(id.wrapping_sub(1) as usize)
            .filter(|p| p.state != PeerState::Unused)
            .ok_or(PeerError::NotFound(id))
    }

    /// Look up by address; a linear scan, the dominant per-packet cost
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|p| p.state != PeerState::Unused && p.addr == Some(addr))
            .map(|p| p.id)
    }

    /// Look up by name; used to deduplicate one peer seen on several
    /// transports
    pub fn find_by_name(&self, name: &str) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|p| p.state != PeerState::Unused && p.name == name)
            .map(|p| p.id)
    }

    /// Iterate the live peers
    pub fn iter_live(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.state != PeerState::Unused)
    }

    /// Iterate the live peers mutably
    pub fn iter_live_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers
            .iter_mut()
            .filter(|p| p.state != PeerState::Unused)
    }
}

//! The engine core: send orchestration, receive dispatch, peer
//! lifecycle, and the poll loop.
//!
//! All transport I/O goes through the boxed [`Platform`]; all
//! application-visible activity comes out of [`Engine::poll`] as
//! [`EngineEvent`] values. The engine itself never blocks: a path that
//! cannot make progress returns `WouldBlock`/`Full` or parks work
//! (fragment plans, streams) to be resumed on a later poll.

use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use peertalk_peer::{ticks_since, Peer, PeerId, PeerRegistry, PeerState};
use peertalk_queue::{Priority, SLOT_PAYLOAD_SIZE};
use peertalk_wire::{
    decode_frame, encode_datagram, encode_frame, BatchIter, Capabilities, CapabilityFlags,
    DiscoveryPacket, DiscoveryType, FragmentHeader, MsgFlags, MsgHeader, MsgType, TransportMask,
    WireError, DATAGRAM_HEADER_SIZE, MSG_HEADER_SIZE,
};

use crate::batch::Batch;
use crate::config::EngineConfig;
use crate::events::EngineEvent;
use crate::fragmenter::{FragmentPlan, FragmentScheduler};
use crate::platform::{Platform, PlatformError};
use crate::stream::{StreamState, MAX_STREAM_SIZE};
use crate::EngineError;

enum PlanOutcome {
    Done,
    Stalled,
    Failed(EngineError),
}

/// The peertalk engine
pub struct Engine {
    config: EngineConfig,
    registry: PeerRegistry,
    platform: Box<dyn Platform>,
    fragments: FragmentScheduler,
    streams: Vec<Option<StreamState>>,
    reasm: Vec<Vec<u8>>,
    next_message_id: u16,
    events: VecDeque<EngineEvent>,
}

impl Engine {
    /// Build an engine from a validated configuration and a transport
    pub fn new(config: EngineConfig, platform: Box<dyn Platform>) -> Result<Self, EngineError> {
        config.validate()?;
        let registry = PeerRegistry::new(
            config.max_peers,
            config.queue_capacity,
            config.direct_buffer_size,
        )?;
        let streams = (0..config.max_peers).map(|_| None).collect();
        let reasm = vec![Vec::new(); config.max_peers];

        Ok(Self {
            config,
            registry,
            platform,
            fragments: FragmentScheduler::new(),
            streams,
            reasm,
            next_message_id: 1,
            events: VecDeque::new(),
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Peer table
    pub fn peers(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Look up a live peer
    pub fn peer(&self, id: PeerId) -> Result<&Peer, EngineError> {
        Ok(self.registry.get(id)?)
    }

    /// Mutable lookup, for embedders driving the queues directly
    pub fn peer_mut(&mut self, id: PeerId) -> Result<&mut Peer, EngineError> {
        Ok(self.registry.get_mut(id)?)
    }

    /// The capability record this node advertises
    pub fn local_capabilities(&self) -> Capabilities {
        let mut flags = CapabilityFlags::STREAMING;
        if self.config.enable_fragmentation {
            flags |= CapabilityFlags::FRAGMENTATION;
        }
        let pressure = self
            .registry
            .iter_live()
            .map(|p| p.send_queue.pressure())
            .max()
            .unwrap_or(0);

        Capabilities {
            max_message_size: self.config.max_message_size,
            preferred_chunk: self.config.preferred_chunk,
            flags,
            buffer_pressure: pressure.min(100),
        }
    }

    // ---- peer lifecycle ------------------------------------------------

    /// Register a peer seen at `addr`, or refresh an existing one
    ///
    /// A peer in Failed state recovers to Discovered when seen again.
    pub fn discover_peer(&mut self, addr: SocketAddr, name: &str) -> Result<PeerId, EngineError> {
        let now = self.platform.ticks();
        let known = self.registry.find_by_addr(addr);
        let id = self.registry.create(addr, name, now)?;

        match known {
            None => self.events.push_back(EngineEvent::PeerDiscovered { peer: id }),
            Some(_) => {
                let peer = self.registry.get_mut(id)?;
                if peer.state() == PeerState::Failed {
                    peer.transition(PeerState::Discovered)?;
                }
            }
        }
        Ok(id)
    }

    /// Begin connecting to a discovered peer
    pub fn connect_peer(&mut self, id: PeerId) -> Result<(), EngineError> {
        self.registry.get_mut(id)?.transition(PeerState::Connecting)?;
        Ok(())
    }

    /// Record that the transport connected; sends local capabilities
    pub fn peer_connected(&mut self, id: PeerId) -> Result<(), EngineError> {
        self.registry.get_mut(id)?.transition(PeerState::Connected)?;
        self.events.push_back(EngineEvent::PeerConnected { peer: id });
        self.send_capabilities(id)
    }

    /// Record a transport-level connection failure
    pub fn peer_failed(&mut self, id: PeerId) -> Result<(), EngineError> {
        self.registry.get_mut(id)?.transition(PeerState::Failed)?;
        self.fragments.remove_peer(id);
        self.streams[Self::slot(id)] = None;
        Ok(())
    }

    /// Gracefully disconnect: notify the peer, then recycle its slot
    pub fn disconnect(&mut self, id: PeerId) -> Result<(), EngineError> {
        if let Err(err) = self.send_control(id, MsgType::Disconnect, MsgFlags::empty(), &[]) {
            debug!(peer = id, %err, "disconnect notification not delivered");
        }
        self.registry.get_mut(id)?.transition(PeerState::Disconnecting)?;
        self.cleanup_peer(id)?;
        self.events.push_back(EngineEvent::PeerDisconnected { peer: id });
        Ok(())
    }

    fn cleanup_peer(&mut self, id: PeerId) -> Result<(), EngineError> {
        self.fragments.remove_peer(id);
        self.streams[Self::slot(id)] = None;
        self.reasm[Self::slot(id)] = Vec::new();
        self.registry.destroy(id)?;
        Ok(())
    }

    fn slot(id: PeerId) -> usize {
        (id - 1) as usize
    }

    // ---- send path -----------------------------------------------------

    /// Send with default priority and no flags
    pub fn send(&mut self, peer: PeerId, payload: &[u8]) -> Result<(), EngineError> {
        self.send_with(peer, payload, Priority::Normal, MsgFlags::empty(), 0)
    }

    /// Send a message, routed across the buffering tiers
    ///
    /// Routing order: UNRELIABLE goes out as a datagram (falling back to
    /// the reliable tiers if the datagram transport refuses); a payload
    /// over the peer's effective maximum is fragmented; a payload over
    /// the small-message threshold stages in the direct buffer; anything
    /// else lands in the slot queue under the backpressure policy.
    pub fn send_with(
        &mut self,
        peer_id: PeerId,
        payload: &[u8],
        priority: Priority,
        flags: MsgFlags,
        coalesce_key: u16,
    ) -> Result<(), EngineError> {
        let local_port = self.config.local_port;
        let threshold = self.config.small_message_threshold;
        let frag_enabled = self.config.enable_fragmentation;

        let peer = self.registry.get_mut(peer_id)?;
        if peer.state() != PeerState::Connected {
            return Err(EngineError::NotConnected(peer_id));
        }

        if flags.contains(MsgFlags::UNRELIABLE) {
            let mut buf = BytesMut::with_capacity(DATAGRAM_HEADER_SIZE + payload.len());
            encode_datagram(local_port, payload, &mut buf);
            match self.platform.send_unreliable(peer_id, &buf) {
                Ok(()) => {
                    peer.stats.messages_sent += 1;
                    peer.stats.bytes_sent += payload.len() as u64;
                    return Ok(());
                }
                Err(err) => {
                    debug!(peer = peer_id, %err, "datagram refused, using reliable path");
                }
            }
        }

        let effective_max = peer.effective_max();
        if effective_max != 0 && payload.len() > effective_max as usize {
            if !frag_enabled || !peer.supports_fragmentation() {
                return Err(EngineError::TooLarge(payload.len()));
            }
            let message_id = self.next_message_id;
            self.next_message_id = self.next_message_id.wrapping_add(1);
            if self.next_message_id == 0 {
                self.next_message_id = 1;
            }
            let plan = FragmentPlan::new(
                peer_id,
                message_id,
                Bytes::copy_from_slice(payload),
                effective_max,
                priority,
            )?;
            return self.fragments.submit(plan);
        }

        if payload.len() > threshold {
            peer.send_buffer.queue(payload, priority)?;
            peer.send_buffer.set_msg_flags((flags & MsgFlags::NO_DELAY).bits());
            return Ok(());
        }

        let key = if flags.contains(MsgFlags::COALESCABLE) {
            coalesce_key
        } else {
            0
        };
        peer.send_queue.try_push(payload, priority, key)?;
        Ok(())
    }

    /// Interrupt-context send: slot-queue only, no logging, no fallback
    ///
    /// Failures and noteworthy outcomes are recorded in the queue's
    /// deferred event flags, which the next poll drains and reports.
    pub fn send_deferred(
        &mut self,
        peer_id: PeerId,
        payload: &[u8],
        priority: Priority,
        coalesce_key: u16,
    ) -> Result<(), EngineError> {
        let peer = self.registry.get_mut(peer_id)?;
        if peer.state() != PeerState::Connected {
            return Err(EngineError::NotConnected(peer_id));
        }
        peer.send_queue.push_deferred(payload, priority, coalesce_key)?;
        Ok(())
    }

    fn send_control(
        &mut self,
        peer_id: PeerId,
        typ: MsgType,
        flags: MsgFlags,
        payload: &[u8],
    ) -> Result<(), EngineError> {
        let peer = self.registry.get_mut(peer_id)?;
        let mut header = MsgHeader::new(typ, peer.next_send_seq(), payload.len() as u16);
        header.flags = flags;
        let mut frame = BytesMut::with_capacity(MSG_HEADER_SIZE + payload.len() + 2);
        encode_frame(&header, payload, &mut frame);
        self.platform.send(peer_id, &frame)?;
        Ok(())
    }

    fn send_capabilities(&mut self, peer_id: PeerId) -> Result<(), EngineError> {
        let caps = self.local_capabilities();
        let mut payload = BytesMut::new();
        caps.encode(&mut payload);
        self.send_control(peer_id, MsgType::Capability, MsgFlags::NO_DELAY, &payload)?;
        self.registry.get_mut(peer_id)?.mark_caps_sent();
        Ok(())
    }

    /// Probe a peer's liveness; the reply feeds its RTT window
    pub fn ping(&mut self, peer_id: PeerId) -> Result<(), EngineError> {
        let echo = self.platform.ticks().to_be_bytes();
        self.send_control(peer_id, MsgType::Ping, MsgFlags::NO_DELAY, &echo)
    }

    // ---- streams -------------------------------------------------------

    /// Start a bulk transfer; one stream per peer at a time
    pub fn stream_send(&mut self, peer_id: PeerId, data: Bytes) -> Result<(), EngineError> {
        if data.len() > MAX_STREAM_SIZE {
            return Err(EngineError::TooLarge(data.len()));
        }
        let peer = self.registry.get(peer_id)?;
        if peer.state() != PeerState::Connected {
            return Err(EngineError::NotConnected(peer_id));
        }
        let slot = Self::slot(peer_id);
        if self.streams[slot].is_some() {
            return Err(EngineError::Busy(peer_id));
        }
        self.streams[slot] = Some(StreamState::new(data));
        Ok(())
    }

    /// Flag the peer's active stream for cancellation at the next poll
    pub fn stream_cancel(&mut self, peer_id: PeerId) -> Result<(), EngineError> {
        match self.streams.get_mut(Self::slot(peer_id)).and_then(Option::as_mut) {
            Some(stream) => {
                stream.cancel();
                Ok(())
            }
            None => Err(EngineError::NotConnected(peer_id)),
        }
    }

    /// Whether a stream is in flight to the peer
    pub fn stream_active(&self, peer_id: PeerId) -> bool {
        self.streams
            .get(Self::slot(peer_id))
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    // ---- receive path --------------------------------------------------

    /// Frame, validate, and dispatch inbound reliable-transport bytes
    ///
    /// Consumes complete frames from `buf`; a trailing partial frame is
    /// left in place for the caller to retry once more bytes arrive.
    pub fn handle_bytes(&mut self, peer_id: PeerId, buf: &mut Bytes) -> Result<(), EngineError> {
        let now = self.platform.ticks();
        while !buf.is_empty() {
            match decode_frame(buf) {
                Ok((header, payload)) => self.dispatch(peer_id, now, header, payload)?,
                Err(WireError::Truncated) => break,
                Err(err) => return Err(err.into()),
            }
        }
        self.deliver_inbound(peer_id);
        Ok(())
    }

    fn dispatch(
        &mut self,
        peer_id: PeerId,
        now: u32,
        header: MsgHeader,
        payload: Bytes,
    ) -> Result<(), EngineError> {
        let peer = self.registry.get_mut(peer_id)?;
        peer.touch(now);
        peer.note_recv_seq(header.seq);

        match header.typ {
            MsgType::Data if header.flags.contains(MsgFlags::FRAGMENT) => {
                self.handle_fragment(peer_id, payload)
            }
            MsgType::Data if header.flags.contains(MsgFlags::BATCH) => {
                for entry in BatchIter::new(payload) {
                    let entry = entry?;
                    self.stage_inbound(peer_id, entry)?;
                }
                Ok(())
            }
            MsgType::Data => self.stage_inbound(peer_id, payload),
            MsgType::Ping => {
                self.send_control(peer_id, MsgType::Pong, MsgFlags::NO_DELAY, &payload)
            }
            MsgType::Pong => {
                if payload.len() == 4 {
                    let then = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    let rtt = ticks_since(now, then);
                    if rtt >= 0 {
                        self.registry.get_mut(peer_id)?.record_rtt(rtt as u32);
                    }
                }
                Ok(())
            }
            MsgType::Disconnect => {
                let _ = self.registry.get_mut(peer_id)?.transition(PeerState::Disconnecting);
                self.cleanup_peer(peer_id)?;
                self.events.push_back(EngineEvent::PeerDisconnected { peer: peer_id });
                Ok(())
            }
            MsgType::Ack | MsgType::Reject => {
                debug!(peer = peer_id, typ = ?header.typ, seq = header.seq, "control message");
                Ok(())
            }
            MsgType::Capability => self.handle_capability(peer_id, payload),
        }
    }

    fn handle_capability(&mut self, peer_id: PeerId, mut payload: Bytes) -> Result<(), EngineError> {
        let caps = Capabilities::decode(&mut payload)?;
        let local_max = self.config.max_message_size;
        let peer = self.registry.get_mut(peer_id)?;
        peer.set_remote_capabilities(caps, local_max);
        debug!(
            peer = peer_id,
            effective_max = peer.effective_max(),
            "capabilities received"
        );
        if !peer.caps_sent() {
            self.send_capabilities(peer_id)?;
        }
        Ok(())
    }

    /// Stage one inbound message: small payloads ride the receive queue,
    /// larger ones are delivered directly
    fn stage_inbound(&mut self, peer_id: PeerId, payload: Bytes) -> Result<(), EngineError> {
        let peer = self.registry.get_mut(peer_id)?;
        peer.stats.messages_received += 1;
        peer.stats.bytes_received += payload.len() as u64;

        if payload.len() <= SLOT_PAYLOAD_SIZE
            && peer.recv_queue.push(&payload, Priority::Normal, 0).is_ok()
        {
            return Ok(());
        }
        self.events.push_back(EngineEvent::MessageReceived {
            peer: peer_id,
            payload,
        });
        Ok(())
    }

    fn handle_fragment(&mut self, peer_id: PeerId, mut payload: Bytes) -> Result<(), EngineError> {
        let header = FragmentHeader::decode(&mut payload)?;
        let slot = Self::slot(peer_id);

        let peer = self.registry.get_mut(peer_id)?;
        // Totals beyond the direct buffer's capacity reassemble in a
        // per-peer overflow scratch allocated for the duration.
        let overflow = header.total_len as usize > peer.recv_buffer.capacity();

        let complete = match peer.reassembly.accept(&header, payload.len()) {
            Ok(complete) => complete,
            Err(err) => {
                warn!(peer = peer_id, %err, "fragment rejected, reassembly abandoned");
                peer.reassembly.reset();
                peer.recv_buffer.complete();
                self.reasm[slot] = Vec::new();
                return Err(err.into());
            }
        };

        if overflow {
            if self.reasm[slot].len() != header.total_len as usize {
                self.reasm[slot] = vec![0; header.total_len as usize];
            }
            let start = header.offset as usize;
            self.reasm[slot][start..start + payload.len()].copy_from_slice(&payload);
        } else {
            peer.recv_buffer.receive_at(header.offset as usize, &payload)?;
        }

        if complete {
            let message = if overflow {
                Bytes::from(mem::take(&mut self.reasm[slot]))
            } else {
                let whole = Bytes::copy_from_slice(peer.recv_buffer.payload());
                peer.recv_buffer.complete();
                whole
            };
            peer.stats.messages_received += 1;
            peer.stats.bytes_received += message.len() as u64;
            self.events.push_back(EngineEvent::MessageReceived {
                peer: peer_id,
                payload: message,
            });
        }
        Ok(())
    }

    /// Handle an inbound unreliable datagram
    pub fn handle_datagram(&mut self, from: SocketAddr, buf: &mut Bytes) -> Result<(), EngineError> {
        let (header, payload) = peertalk_wire::decode_datagram(buf)?;
        let sender = SocketAddr::new(from.ip(), header.sender_port);
        let peer = self.registry.find_by_addr(sender);
        if let Some(id) = peer {
            let now = self.platform.ticks();
            self.registry.get_mut(id)?.touch(now);
        }
        self.events
            .push_back(EngineEvent::DatagramReceived { peer, payload });
        Ok(())
    }

    // ---- discovery -----------------------------------------------------

    /// Encode this node's discovery announcement
    pub fn announce_packet(&self) -> Result<Bytes, EngineError> {
        let packet = DiscoveryPacket::announce(
            self.config.local_port,
            TransportMask::TCP | TransportMask::UDP,
            &self.config.name,
        );
        let mut buf = BytesMut::new();
        packet.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode this node's departure notification
    pub fn goodbye_packet(&self) -> Result<Bytes, EngineError> {
        let packet = DiscoveryPacket {
            typ: DiscoveryType::Goodbye,
            ..DiscoveryPacket::announce(
                self.config.local_port,
                TransportMask::TCP | TransportMask::UDP,
                &self.config.name,
            )
        };
        let mut buf = BytesMut::new();
        packet.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Handle an inbound discovery packet
    pub fn handle_discovery(&mut self, from: SocketAddr, buf: &mut Bytes) -> Result<(), EngineError> {
        let packet = DiscoveryPacket::decode(buf)?;
        let sender = SocketAddr::new(from.ip(), packet.sender_port);

        match packet.typ {
            DiscoveryType::Announce => {
                self.discover_peer(sender, &packet.name)?;
            }
            DiscoveryType::Query => {
                self.events.push_back(EngineEvent::DiscoveryQuery { from });
            }
            DiscoveryType::Goodbye => {
                if let Some(id) = self.registry.find_by_addr(sender) {
                    self.cleanup_peer(id)?;
                    self.events.push_back(EngineEvent::PeerLost { peer: id });
                }
            }
        }
        Ok(())
    }

    // ---- poll loop -----------------------------------------------------

    /// Advance all pending work and drain the accumulated events
    pub fn poll(&mut self) -> Vec<EngineEvent> {
        let now = self.platform.ticks();
        self.drain_deferred();
        self.advance_fragments();
        self.drain_direct_buffers();
        self.drain_batches();
        self.advance_streams();
        self.deliver_inbound_all();
        self.evict_timed_out(now);
        self.events.drain(..).collect()
    }

    /// Report events the interrupt-context push path recorded
    fn drain_deferred(&mut self) {
        for peer in self.registry.iter_live_mut() {
            let pending = peer.send_queue.take_deferred_events();
            if !pending.is_empty() {
                warn!(peer = peer.id(), events = ?pending, "deferred queue events");
            }
        }
    }

    fn advance_fragments(&mut self) {
        let rounds = self.fragments.len();
        for _ in 0..rounds {
            let Some(mut plan) = self.fragments.take_next() else {
                break;
            };
            match self.drive_plan(&mut plan) {
                PlanOutcome::Done => {
                    self.events.push_back(EngineEvent::MessageSent {
                        peer: plan.peer(),
                        bytes: plan.message_len(),
                    });
                }
                PlanOutcome::Stalled => self.fragments.requeue(plan),
                PlanOutcome::Failed(error) => {
                    // Fragments already on the wire are not retracted;
                    // the receiver times the partial message out.
                    warn!(peer = plan.peer(), %error, "fragment plan abandoned");
                    self.events.push_back(EngineEvent::SendFailed {
                        peer: plan.peer(),
                        error,
                    });
                }
            }
        }
    }

    fn drive_plan(&mut self, plan: &mut FragmentPlan) -> PlanOutcome {
        loop {
            if plan.is_done() {
                return PlanOutcome::Done;
            }
            let peer = match self.registry.get_mut(plan.peer()) {
                Ok(peer) => peer,
                Err(err) => return PlanOutcome::Failed(err.into()),
            };
            if peer.state() != PeerState::Connected {
                return PlanOutcome::Failed(EngineError::NotConnected(plan.peer()));
            }
            if !peer.send_buffer.is_available() {
                return PlanOutcome::Stalled;
            }

            let mut staged = BytesMut::new();
            plan.build_next(&mut staged);
            if let Err(err) = peer.send_buffer.queue(&staged, plan.priority()) {
                return PlanOutcome::Failed(err.into());
            }
            peer.send_buffer.set_msg_flags(MsgFlags::FRAGMENT.bits());

            match Self::flush_direct(self.platform.as_mut(), peer) {
                Ok(_) => plan.advance(),
                Err(EngineError::Platform(PlatformError::WouldBlock)) => {
                    // The staged fragment was released by complete();
                    // build_next reproduces it on the next poll.
                    return PlanOutcome::Stalled;
                }
                Err(err) => return PlanOutcome::Failed(err),
            }
        }
    }

    /// Frame and send one ready direct buffer; `complete()` runs whether
    /// the transport accepted the bytes or not
    fn flush_direct(platform: &mut dyn Platform, peer: &mut Peer) -> Result<usize, EngineError> {
        let flags = MsgFlags::from_bits_truncate(peer.send_buffer.msg_flags());
        let payload_len = peer.send_buffer.payload().len();
        let mut header = MsgHeader::new(MsgType::Data, peer.next_send_seq(), payload_len as u16);
        header.flags = flags;

        let mut frame = BytesMut::with_capacity(MSG_HEADER_SIZE + payload_len + 2);
        encode_frame(&header, peer.send_buffer.payload(), &mut frame);

        peer.send_buffer.mark_sending()?;
        let result = platform.send(peer.id(), &frame);
        peer.send_buffer.complete();

        match result {
            Ok(()) => {
                peer.stats.messages_sent += 1;
                peer.stats.bytes_sent += payload_len as u64;
                Ok(frame.len())
            }
            Err(err) => {
                peer.stats.send_errors += 1;
                Err(err.into())
            }
        }
    }

    fn drain_direct_buffers(&mut self) {
        for peer in self.registry.iter_live_mut() {
            if peer.state() != PeerState::Connected || !peer.send_buffer.is_ready() {
                continue;
            }
            let id = peer.id();
            match Self::flush_direct(self.platform.as_mut(), peer) {
                Ok(bytes) => self
                    .events
                    .push_back(EngineEvent::MessageSent { peer: id, bytes }),
                Err(error) => self
                    .events
                    .push_back(EngineEvent::SendFailed { peer: id, error }),
            }
        }
    }

    fn drain_batches(&mut self) {
        let mut batch = Batch::new();
        for peer in self.registry.iter_live_mut() {
            if peer.state() != PeerState::Connected {
                continue;
            }
            let id = peer.id();

            'peer: loop {
                batch.clear();
                loop {
                    let added = match peer.send_queue.pop_direct() {
                        Ok((payload, _priority)) => batch.try_add(payload),
                        Err(_) => break,
                    };
                    if !added {
                        break;
                    }
                    // The entry is only removed once it is safely copied
                    // into the batch.
                    let _ = peer.send_queue.pop_commit();
                }
                if batch.is_empty() {
                    break;
                }

                let mut header =
                    MsgHeader::new(MsgType::Data, peer.next_send_seq(), batch.payload().len() as u16);
                header.flags = MsgFlags::BATCH;
                let mut frame = BytesMut::with_capacity(MSG_HEADER_SIZE + batch.payload().len() + 2);
                encode_frame(&header, batch.payload(), &mut frame);

                match self.platform.send(id, &frame) {
                    Ok(()) => {
                        peer.stats.messages_sent += batch.count() as u64;
                        peer.stats.bytes_sent += batch.payload().len() as u64;
                        self.events.push_back(EngineEvent::MessageSent {
                            peer: id,
                            bytes: frame.len(),
                        });
                    }
                    Err(err) => {
                        peer.stats.send_errors += 1;
                        self.events.push_back(EngineEvent::SendFailed {
                            peer: id,
                            error: err.into(),
                        });
                        break 'peer;
                    }
                }
            }
        }
    }

    fn advance_streams(&mut self) {
        for idx in 0..self.streams.len() {
            let Some(mut stream) = self.streams[idx].take() else {
                continue;
            };
            let peer_id = (idx + 1) as PeerId;

            if stream.is_cancelled() {
                self.events.push_back(EngineEvent::StreamCancelled {
                    peer: peer_id,
                    bytes_sent: stream.bytes_sent(),
                });
                continue;
            }

            let chunk_size = {
                let Ok(peer) = self.registry.get(peer_id) else {
                    self.events.push_back(EngineEvent::StreamFailed {
                        peer: peer_id,
                        bytes_sent: stream.bytes_sent(),
                        error: EngineError::NotConnected(peer_id),
                    });
                    continue;
                };
                match peer.capabilities().preferred_chunk {
                    0 => self.config.preferred_chunk as usize,
                    chunk => chunk as usize,
                }
            };

            let mut keep = true;
            loop {
                if stream.is_done() {
                    self.events.push_back(EngineEvent::StreamComplete {
                        peer: peer_id,
                        bytes: stream.bytes_sent(),
                    });
                    keep = false;
                    break;
                }
                let sent = {
                    let chunk = stream.next_chunk(chunk_size);
                    match self.send_stream_chunk(peer_id, chunk) {
                        Ok(()) => chunk.len(),
                        Err(EngineError::Platform(PlatformError::WouldBlock)) => {
                            break; // resume next poll
                        }
                        Err(error) => {
                            self.events.push_back(EngineEvent::StreamFailed {
                                peer: peer_id,
                                bytes_sent: stream.bytes_sent(),
                                error,
                            });
                            keep = false;
                            break;
                        }
                    }
                };
                stream.advance(sent);
            }
            if keep {
                self.streams[idx] = Some(stream);
            }
        }
    }

    fn send_stream_chunk(&mut self, peer_id: PeerId, chunk: &[u8]) -> Result<(), EngineError> {
        let peer = self.registry.get_mut(peer_id)?;
        let mut header = MsgHeader::new(MsgType::Data, peer.next_send_seq(), chunk.len() as u16);
        header.flags = MsgFlags::NO_DELAY;
        let mut frame = BytesMut::with_capacity(MSG_HEADER_SIZE + chunk.len() + 2);
        encode_frame(&header, chunk, &mut frame);

        let result = self.platform.send(peer_id, &frame);
        let peer = self.registry.get_mut(peer_id)?;
        match result {
            Ok(()) => {
                peer.stats.messages_sent += 1;
                peer.stats.bytes_sent += chunk.len() as u64;
                Ok(())
            }
            Err(err) => {
                peer.stats.send_errors += 1;
                Err(err.into())
            }
        }
    }

    fn deliver_inbound_all(&mut self) {
        let ids: Vec<PeerId> = self.registry.iter_live().map(|p| p.id()).collect();
        for id in ids {
            self.deliver_inbound(id);
        }
    }

    /// Drain the peer's staged inbound messages into events
    fn deliver_inbound(&mut self, peer_id: PeerId) {
        let Ok(peer) = self.registry.get_mut(peer_id) else {
            return;
        };
        while let Ok((payload, _priority)) = peer.recv_queue.pop() {
            self.events.push_back(EngineEvent::MessageReceived {
                peer: peer_id,
                payload: Bytes::from(payload),
            });
        }
    }

    fn evict_timed_out(&mut self, now: u32) {
        let timeout = self.config.peer_timeout_ms;
        let expired: Vec<PeerId> = self
            .registry
            .iter_live()
            .filter(|p| p.is_timed_out(now, timeout))
            .map(|p| p.id())
            .collect();

        for id in expired {
            warn!(peer = id, "peer timed out");
            if self.cleanup_peer(id).is_ok() {
                self.events.push_back(EngineEvent::PeerLost { peer: id });
            }
        }
    }
}

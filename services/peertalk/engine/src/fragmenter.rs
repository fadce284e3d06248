//! Outbound fragmentation planning.
//!
//! A payload larger than a peer's effective maximum becomes a
//! [`FragmentPlan`]: the whole payload plus a cursor, drained fragment
//! by fragment through the peer's send direct buffer. Plans live in the
//! [`FragmentScheduler`] and are advanced by the engine's poll loop
//! until the transport pushes back, so one long message never depends
//! on the embedder's poll cadence to finish and never starves another
//! peer's traffic.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use peertalk_peer::PeerId;
use peertalk_queue::Priority;
use peertalk_wire::{FragFlags, FragmentHeader, FRAGMENT_HEADER_SIZE};

use crate::EngineError;

/// Smallest useful per-fragment data capacity
pub const MIN_FRAGMENT_DATA: usize = 64;

/// One message split into fragments, with a send cursor
#[derive(Debug)]
pub struct FragmentPlan {
    peer: PeerId,
    message_id: u16,
    payload: Bytes,
    max_data: usize,
    offset: usize,
    priority: Priority,
}

impl FragmentPlan {
    /// Plan fragmentation of `payload` for a peer with the given
    /// effective maximum
    pub fn new(
        peer: PeerId,
        message_id: u16,
        payload: Bytes,
        effective_max: u16,
        priority: Priority,
    ) -> Result<Self, EngineError> {
        if payload.len() > u16::MAX as usize {
            return Err(EngineError::TooLarge(payload.len()));
        }
        let max_data = (effective_max as usize).saturating_sub(FRAGMENT_HEADER_SIZE);
        if max_data < MIN_FRAGMENT_DATA {
            return Err(EngineError::EffectiveMaxTooSmall(effective_max));
        }

        Ok(Self {
            peer,
            message_id,
            payload,
            max_data,
            offset: 0,
            priority,
        })
    }

    /// Destination peer
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Message id shared by every fragment of this plan
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// Priority the fragments are staged at
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// True once every fragment has been committed
    pub fn is_done(&self) -> bool {
        self.offset >= self.payload.len()
    }

    /// Payload bytes not yet committed
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.offset
    }

    /// Length of the whole message being fragmented
    pub fn message_len(&self) -> usize {
        self.payload.len()
    }

    /// Total number of fragments this plan produces
    pub fn fragment_count(&self) -> usize {
        self.payload.len().div_ceil(self.max_data)
    }

    /// Encode the fragment at the current cursor: header plus data
    ///
    /// Does not move the cursor; the caller commits with
    /// [`FragmentPlan::advance`] only after the fragment is safely
    /// queued, so a transport push-back rebuilds the same fragment on
    /// the next attempt.
    pub fn build_next(&self, buf: &mut BytesMut) {
        debug_assert!(!self.is_done());
        let len = self.remaining().min(self.max_data);
        let mut flags = FragFlags::empty();
        if self.offset == 0 {
            flags |= FragFlags::FIRST;
        }
        if self.remaining() <= self.max_data {
            flags |= FragFlags::LAST;
        }

        let header = FragmentHeader::new(
            self.message_id,
            self.payload.len() as u16,
            self.offset as u16,
            flags,
        );
        header.encode(buf);
        buf.extend_from_slice(&self.payload[self.offset..self.offset + len]);
    }

    /// Commit the fragment built by the last [`FragmentPlan::build_next`]
    pub fn advance(&mut self) {
        let len = self.remaining().min(self.max_data);
        self.offset += len;
    }
}

/// Round-robin queue of pending fragment plans, one per peer at most
#[derive(Default)]
pub struct FragmentScheduler {
    plans: VecDeque<FragmentPlan>,
}

impl FragmentScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of plans awaiting fragments
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    /// True when no plan is pending
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Whether a plan is already pending for the peer
    pub fn has_plan_for(&self, peer: PeerId) -> bool {
        self.plans.iter().any(|p| p.peer == peer)
    }

    /// Queue a plan; one message at a time per peer
    pub fn submit(&mut self, plan: FragmentPlan) -> Result<(), EngineError> {
        if self.has_plan_for(plan.peer) {
            return Err(EngineError::Busy(plan.peer));
        }
        self.plans.push_back(plan);
        Ok(())
    }

    /// Take the next plan in round-robin order
    pub fn take_next(&mut self) -> Option<FragmentPlan> {
        self.plans.pop_front()
    }

    /// Return an unfinished plan to the back of the rotation
    pub fn requeue(&mut self, plan: FragmentPlan) {
        self.plans.push_back(plan);
    }

    /// Drop any plan targeting the peer (peer destroyed)
    pub fn remove_peer(&mut self, peer: PeerId) {
        self.plans.retain(|p| p.peer != peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_fragment(buf: &mut Bytes) -> (FragmentHeader, Bytes) {
        let header = FragmentHeader::decode(buf).unwrap();
        let data = buf.clone();
        (header, data)
    }

    #[test]
    fn test_ten_kilobytes_at_2048_makes_five_fragments() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let mut plan =
            FragmentPlan::new(1, 77, Bytes::from(payload.clone()), 2048, Priority::Normal)
                .unwrap();
        assert_eq!(plan.fragment_count(), 5);

        let mut rebuilt = Vec::new();
        let mut sizes = Vec::new();
        let mut first_flags = Vec::new();
        while !plan.is_done() {
            let mut buf = BytesMut::new();
            plan.build_next(&mut buf);
            let mut bytes = buf.freeze();
            let (header, data) = decode_fragment(&mut bytes);

            assert_eq!(header.message_id, 77);
            assert_eq!(header.total_len, 10_000);
            assert_eq!(header.offset as usize, rebuilt.len());
            sizes.push(data.len());
            first_flags.push(header.flags);
            rebuilt.extend_from_slice(&data);
            plan.advance();
        }

        assert_eq!(sizes, vec![2040, 2040, 2040, 2040, 1840]);
        assert_eq!(rebuilt, payload);
        assert!(first_flags[0].contains(FragFlags::FIRST));
        assert!(!first_flags[0].contains(FragFlags::LAST));
        for flags in &first_flags[1..4] {
            assert!(!flags.contains(FragFlags::FIRST) && !flags.contains(FragFlags::LAST));
        }
        assert!(first_flags[4].contains(FragFlags::LAST));
    }

    #[test]
    fn test_build_without_advance_is_stable() {
        let mut plan =
            FragmentPlan::new(1, 5, Bytes::from(vec![9u8; 500]), 256, Priority::Normal).unwrap();

        let mut a = BytesMut::new();
        plan.build_next(&mut a);
        let mut b = BytesMut::new();
        plan.build_next(&mut b);
        assert_eq!(a, b);

        plan.advance();
        let mut c = BytesMut::new();
        plan.build_next(&mut c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_effective_max_floor() {
        let err = FragmentPlan::new(1, 1, Bytes::from(vec![0u8; 400]), 64, Priority::Normal)
            .unwrap_err();
        assert_eq!(err, EngineError::EffectiveMaxTooSmall(64));
    }

    #[test]
    fn test_scheduler_one_plan_per_peer() {
        let mut sched = FragmentScheduler::new();
        let plan = |peer| {
            FragmentPlan::new(peer, 1, Bytes::from(vec![0u8; 4000]), 1024, Priority::Normal)
                .unwrap()
        };

        sched.submit(plan(1)).unwrap();
        sched.submit(plan(2)).unwrap();
        assert_eq!(sched.submit(plan(1)), Err(EngineError::Busy(1)));

        let first = sched.take_next().unwrap();
        assert_eq!(first.peer(), 1);
        sched.requeue(first);
        assert_eq!(sched.take_next().unwrap().peer(), 2);

        sched.remove_peer(1);
        assert!(sched.is_empty() || !sched.has_plan_for(1));
    }
}

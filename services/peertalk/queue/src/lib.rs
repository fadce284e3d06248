//! Fixed-capacity buffering for the peertalk transport engine.
//!
//! Two tiers live here. The [`SlotQueue`] is a pre-allocated,
//! power-of-two array of 256-byte slots with per-priority intrusive
//! lists (O(1) dequeue of the highest occupied priority) and a small
//! hash table for key-based coalescing (O(1) replace-in-place). The
//! [`DirectBuffer`] stages one large message per peer per direction
//! through a tiny idle/queued/sending state machine.
//!
//! Nothing in this crate allocates after construction, and the
//! interrupt-context push variant never logs; both properties matter on
//! the constrained hosts this engine targets.

pub mod direct;
pub mod error;
pub mod slot_queue;

pub use direct::{DirectBuffer, DirectState, DIRECT_DEFAULT_SIZE, DIRECT_MAX_SIZE};
pub use error::QueueError;
pub use slot_queue::{
    Backpressure, DeferredEvents, Priority, SlotQueue, SlotQueueStats, MAX_QUEUE_CAPACITY,
    SLOT_PAYLOAD_SIZE,
};

//! Send orchestration and the peertalk engine core.
//!
//! The engine ties the lower layers together: it routes outbound
//! messages across the two buffering tiers, fragments payloads that
//! exceed a peer's negotiated capacity, batches small queued messages
//! into single wire writes, frames and dispatches inbound bytes, and
//! drives peer lifecycle and capability negotiation.
//!
//! The engine is a cooperative, single-threaded core: all transport I/O
//! goes through the [`Platform`] trait object the embedder supplies,
//! and all application-visible activity is reported as [`EngineEvent`]
//! values drained from [`Engine::poll`]. Nothing here blocks, spawns,
//! or allocates on the per-message hot paths.

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod fragmenter;
pub mod platform;
pub mod stream;

pub use batch::{Batch, BATCH_MAX_SIZE};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use events::EngineEvent;
pub use fragmenter::{FragmentPlan, FragmentScheduler, MIN_FRAGMENT_DATA};
pub use platform::{Platform, PlatformError};
pub use stream::{StreamState, MAX_STREAM_SIZE};

//! Engine configuration.

use peertalk_queue::{QueueError, DIRECT_MAX_SIZE, MAX_QUEUE_CAPACITY};
use peertalk_wire::{MAX_ADVERTISED_MAX, MIN_ADVERTISED_MAX};

use crate::EngineError;

/// Configuration consumed by [`crate::Engine`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Local display name advertised in discovery
    pub name: String,
    /// Port peers should connect to for reliable transport
    pub local_port: u16,
    /// Maximum peer slots
    pub max_peers: usize,
    /// Slots per peer per direction (power of two)
    pub queue_capacity: usize,
    /// Payloads at or below this size ride the slot queue
    pub small_message_threshold: usize,
    /// Direct buffer capacity per peer per direction
    pub direct_buffer_size: usize,
    /// Milliseconds between discovery announcements
    pub discovery_interval_ms: u32,
    /// Milliseconds of silence before a peer is evicted
    pub peer_timeout_ms: u32,
    /// Whether oversized payloads are fragmented automatically
    pub enable_fragmentation: bool,
    /// Advertised maximum message size (256-8192)
    pub max_message_size: u16,
    /// Advertised preferred streaming chunk size
    pub preferred_chunk: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            local_port: 7354,
            max_peers: 16,
            queue_capacity: 32,
            small_message_threshold: 256,
            direct_buffer_size: 4096,
            discovery_interval_ms: 5_000,
            peer_timeout_ms: 15_000,
            enable_fragmentation: true,
            max_message_size: 8192,
            preferred_chunk: 1024,
        }
    }
}

impl EngineConfig {
    /// Check the configuration against the engine's structural limits
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.queue_capacity == 0 || !self.queue_capacity.is_power_of_two() {
            return Err(QueueError::NotPowerOfTwo(self.queue_capacity).into());
        }
        if self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(QueueError::TooLarge(self.queue_capacity).into());
        }
        if self.direct_buffer_size > DIRECT_MAX_SIZE {
            return Err(QueueError::TooLarge(self.direct_buffer_size).into());
        }
        if !(MIN_ADVERTISED_MAX..=MAX_ADVERTISED_MAX).contains(&self.max_message_size) {
            return Err(EngineError::TooLarge(self.max_message_size as usize));
        }
        if self.max_peers == 0 {
            return Err(EngineError::TooLarge(0));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bad_queue_capacity() {
        let config = EngineConfig {
            queue_capacity: 12,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_buffer() {
        let config = EngineConfig {
            direct_buffer_size: DIRECT_MAX_SIZE + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_advertised_max_bounds() {
        let config = EngineConfig {
            max_message_size: 128,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

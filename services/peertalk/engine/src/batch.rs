//! Outbound batch assembly.
//!
//! Queued small messages are concatenated into one wire frame per
//! drain, each entry prefixed with a 4-byte length header. The batch
//! budget sits comfortably under a typical link MTU so one flush maps
//! to one transport write.

use bytes::BytesMut;

use peertalk_wire::{encode_batch_entry, BATCH_ENTRY_HEADER_SIZE};

/// Batch payload budget in bytes
pub const BATCH_MAX_SIZE: usize = 1400;

/// Accumulates length-prefixed entries up to the batch budget
pub struct Batch {
    buf: BytesMut,
    count: usize,
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl Batch {
    /// Create an empty batch with its full budget reserved
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(BATCH_MAX_SIZE),
            count: 0,
        }
    }

    /// Entries added since the last clear
    pub fn count(&self) -> usize {
        self.count
    }

    /// True when no entry has been added
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Batched payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    /// Reset for the next batch
    pub fn clear(&mut self) {
        self.buf.clear();
        self.count = 0;
    }

    /// Append an entry if it fits the remaining budget
    ///
    /// Returns false when the entry would overflow; the caller flushes
    /// the current batch and retries on a fresh one.
    pub fn try_add(&mut self, payload: &[u8]) -> bool {
        let needed = BATCH_ENTRY_HEADER_SIZE + payload.len();
        if self.buf.len() + needed > BATCH_MAX_SIZE {
            return false;
        }
        encode_batch_entry(&mut self.buf, payload);
        self.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use peertalk_wire::BatchIter;

    #[test]
    fn test_entries_roundtrip_through_iter() {
        let mut batch = Batch::new();
        assert!(batch.try_add(b"one"));
        assert!(batch.try_add(b"two"));
        assert_eq!(batch.count(), 2);

        let entries: Vec<Bytes> = BatchIter::new(Bytes::copy_from_slice(batch.payload()))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(&entries[0][..], b"one");
        assert_eq!(&entries[1][..], b"two");
    }

    #[test]
    fn test_budget_enforced() {
        let mut batch = Batch::new();
        let entry = [0u8; 250];
        let per_entry = BATCH_ENTRY_HEADER_SIZE + entry.len();
        let fits = BATCH_MAX_SIZE / per_entry;

        for _ in 0..fits {
            assert!(batch.try_add(&entry));
        }
        assert!(!batch.try_add(&entry));
        assert_eq!(batch.count(), fits);

        batch.clear();
        assert!(batch.is_empty());
        assert!(batch.try_add(&entry));
    }
}

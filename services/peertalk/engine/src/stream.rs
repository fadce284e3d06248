//! Bulk transfer streams.
//!
//! A stream is a one-shot bulk payload pushed to a peer in
//! transport-sized chunks across successive polls. Unlike fragmented
//! messages, stream chunks bypass the direct buffer and go straight to
//! the transport, so a stream never contends with queued traffic for
//! buffer space. One stream per peer at a time.

use bytes::Bytes;

/// Upper bound on a single stream payload
pub const MAX_STREAM_SIZE: usize = 65_536;

/// In-flight bulk transfer to one peer
pub struct StreamState {
    data: Bytes,
    sent: usize,
    cancelled: bool,
}

impl StreamState {
    /// Begin a stream over `data`
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            sent: 0,
            cancelled: false,
        }
    }

    /// Total payload length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length payload
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes already delivered to the transport
    pub fn bytes_sent(&self) -> usize {
        self.sent
    }

    /// True once every byte has been delivered
    pub fn is_done(&self) -> bool {
        self.sent >= self.data.len()
    }

    /// Whether the sender asked to stop
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Mark the stream cancelled; no further chunks are produced
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// The next chunk to send, at most `chunk` bytes
    pub fn next_chunk(&self, chunk: usize) -> &[u8] {
        let end = (self.sent + chunk).min(self.data.len());
        &self.data[self.sent..end]
    }

    /// Commit `n` bytes as delivered
    pub fn advance(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.data.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunked_progress() {
        let mut stream = StreamState::new(Bytes::from(vec![7u8; 2500]));
        let mut total = 0;
        while !stream.is_done() {
            let chunk = stream.next_chunk(1024);
            assert!(chunk.len() <= 1024);
            total += chunk.len();
            let n = chunk.len();
            stream.advance(n);
        }
        assert_eq!(total, 2500);
        assert_eq!(stream.bytes_sent(), 2500);
    }

    #[test]
    fn test_cancel_keeps_progress() {
        let mut stream = StreamState::new(Bytes::from(vec![1u8; 100]));
        stream.advance(40);
        stream.cancel();
        assert!(stream.is_cancelled());
        assert_eq!(stream.bytes_sent(), 40);
        assert!(!stream.is_done());
    }
}

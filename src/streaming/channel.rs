//! Channel types for the payload pipeline.
//!
//! Two tasks per side, joined by a bounded channel for backpressure:
//!
//! ```text
//! source:       export reader --> [PayloadMessage] --> encrypt + frame --> wire
//! destination:  wire --> deframe + decrypt --> [PayloadMessage] --> import writer
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Plaintext bytes per encrypted segment.
pub const DATA_CHUNK_SIZE: usize = 256 * 1024; // 256KB

/// Segments buffered between producer and consumer.
pub const PAYLOAD_CHANNEL_SIZE: usize = 16;

/// Transfer direction requested by the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Initiator sends its own snapshot.
    Push,
    /// Initiator fetches a snapshot owned by the responder.
    Pull,
    /// Initiator fetches back one of its own backups.
    Recover,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
            Direction::Recover => "recover",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Pipeline messages
// =============================================================================

/// One step of the payload pipe. `End` is explicit so that a producer that
/// vanished is never mistaken for end-of-stream.
#[derive(Debug)]
pub enum PayloadMessage {
    Chunk(Bytes),
    End,
    Failed(String),
}

pub type PayloadSender = mpsc::Sender<PayloadMessage>;
pub type PayloadReceiver = mpsc::Receiver<PayloadMessage>;

pub fn payload_channel() -> (PayloadSender, PayloadReceiver) {
    mpsc::channel(PAYLOAD_CHANNEL_SIZE)
}

// =============================================================================
// Payload accounting
// =============================================================================

/// Running byte count and BLAKE3 digest of plaintext payload.
#[derive(Debug, Default)]
pub struct PayloadDigest {
    bytes: u64,
    hasher: blake3::Hasher,
}

impl PayloadDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.bytes += data.len() as u64;
        self.hasher.update(data);
    }

    pub fn finish(&self) -> PayloadSummary {
        PayloadSummary {
            bytes: self.bytes,
            digest: *self.hasher.finalize().as_bytes(),
        }
    }
}

/// What both ends must agree on before the sender commits lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSummary {
    pub bytes: u64,
    pub digest: [u8; 32],
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_independent_of_chunking() {
        let mut a = PayloadDigest::new();
        a.update(b"hello ");
        a.update(b"world");

        let mut b = PayloadDigest::new();
        b.update(b"hello world");

        assert_eq!(a.finish(), b.finish());
        assert_eq!(a.finish().bytes, 11);
    }

    #[tokio::test]
    async fn test_payload_channel_is_bounded() {
        let (tx, mut rx) = payload_channel();
        for _ in 0..PAYLOAD_CHANNEL_SIZE {
            tx.try_send(PayloadMessage::Chunk(Bytes::from_static(b"x")))
                .unwrap();
        }
        assert!(tx.try_send(PayloadMessage::End).is_err());

        assert!(matches!(rx.recv().await, Some(PayloadMessage::Chunk(_))));
        tx.try_send(PayloadMessage::End).unwrap();
    }
}

//! Payload encryption: XChaCha20-Poly1305 in the STREAM construction.
//!
//! Segments carry a 32-bit big-endian counter and a last-block flag inside
//! the nonce, so a reordered, replayed, or truncated stream fails to open.

use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::stream::{DecryptorBE32, EncryptorBE32};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305};
use rand::RngCore;

use crate::error::TransferError;

/// XChaCha20 nonce minus the 5 bytes STREAM reserves for counter and flag.
pub const STREAM_NONCE_LEN: usize = 19;

/// Poly1305 tag appended to every segment.
pub const SEGMENT_OVERHEAD: usize = 16;

pub fn generate_stream_nonce() -> [u8; STREAM_NONCE_LEN] {
    let mut nonce = [0u8; STREAM_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Encrypting half, held by the source.
pub struct SegmentSealer {
    inner: EncryptorBE32<XChaCha20Poly1305>,
}

impl SegmentSealer {
    pub fn new(key: &[u8; 32], nonce: &[u8; STREAM_NONCE_LEN]) -> Self {
        let aead = XChaCha20Poly1305::new(Key::from_slice(key));
        Self {
            inner: EncryptorBE32::from_aead(aead, GenericArray::from_slice(nonce)),
        }
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TransferError> {
        self.inner
            .encrypt_next(plaintext)
            .map_err(|_| TransferError::Protocol("payload exceeds stream cipher limit".into()))
    }

    /// Seal the final segment. Consumes the sealer.
    pub fn seal_last(self, plaintext: &[u8]) -> Result<Vec<u8>, TransferError> {
        self.inner
            .encrypt_last(plaintext)
            .map_err(|_| TransferError::Protocol("payload exceeds stream cipher limit".into()))
    }
}

/// Decrypting half, held by the destination.
pub struct SegmentOpener {
    inner: DecryptorBE32<XChaCha20Poly1305>,
}

impl SegmentOpener {
    pub fn new(key: &[u8; 32], nonce: &[u8; STREAM_NONCE_LEN]) -> Self {
        let aead = XChaCha20Poly1305::new(Key::from_slice(key));
        Self {
            inner: DecryptorBE32::from_aead(aead, GenericArray::from_slice(nonce)),
        }
    }

    pub fn open(&mut self, segment: &[u8]) -> Result<Vec<u8>, TransferError> {
        self.inner
            .decrypt_next(segment)
            .map_err(|_| TransferError::Integrity)
    }

    /// Open the final segment. Consumes the opener.
    pub fn open_last(self, segment: &[u8]) -> Result<Vec<u8>, TransferError> {
        self.inner
            .decrypt_last(segment)
            .map_err(|_| TransferError::Integrity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [42; 32];

    fn seal_all(parts: &[&str], last: &[u8]) -> (Vec<Vec<u8>>, Vec<u8>) {
        let mut sealer = SegmentSealer::new(&KEY, &[1; STREAM_NONCE_LEN]);
        let segments = parts.iter().map(|p| sealer.seal(p.as_bytes()).unwrap()).collect();
        (segments, sealer.seal_last(last).unwrap())
    }

    #[test]
    fn test_stream_opens_in_order() {
        let (segments, last) = seal_all(&["first", "second"], b"");
        assert_eq!(segments[0].len(), 5 + SEGMENT_OVERHEAD);

        let mut opener = SegmentOpener::new(&KEY, &[1; STREAM_NONCE_LEN]);
        assert_eq!(opener.open(&segments[0]).unwrap(), b"first");
        assert_eq!(opener.open(&segments[1]).unwrap(), b"second");
        assert!(opener.open_last(&last).unwrap().is_empty());
    }

    #[test]
    fn test_reordering_detected() {
        let (segments, _) = seal_all(&["first", "second"], b"");
        let mut opener = SegmentOpener::new(&KEY, &[1; STREAM_NONCE_LEN]);
        assert!(matches!(
            opener.open(&segments[1]),
            Err(TransferError::Integrity)
        ));
    }

    #[test]
    fn test_truncation_detected() {
        let (segments, _) = seal_all(&["first", "second"], b"tail");
        let mut opener = SegmentOpener::new(&KEY, &[1; STREAM_NONCE_LEN]);
        opener.open(&segments[0]).unwrap();
        // An intermediate segment presented as the final one does not open.
        assert!(opener.open_last(&segments[1]).is_err());
    }

    #[test]
    fn test_wrong_key_or_nonce() {
        let (segments, _) = seal_all(&["first"], b"");
        let mut opener = SegmentOpener::new(&[0; 32], &[1; STREAM_NONCE_LEN]);
        assert!(opener.open(&segments[0]).is_err());
        let mut opener = SegmentOpener::new(&KEY, &[2; STREAM_NONCE_LEN]);
        assert!(opener.open(&segments[0]).is_err());
    }

    #[test]
    fn test_tampered_segment() {
        let (mut segments, _) = seal_all(&["first"], b"");
        segments[0][0] ^= 1;
        let mut opener = SegmentOpener::new(&KEY, &[1; STREAM_NONCE_LEN]);
        assert!(opener.open(&segments[0]).is_err());
    }
}

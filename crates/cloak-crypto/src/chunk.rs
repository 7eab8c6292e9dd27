//! Per-chunk XChaCha20-Poly1305 framing
//!
//! Every chunk is sealed on its own with a fresh random nonce, so frames can be
//! produced and consumed strictly sequentially with bounded memory:
//! ```text
//! [24 bytes: nonce][u32 BE: payload length][payload: ciphertext || 16-byte tag]
//! ```
//!
//! Any malformed frame (short or oversized length, truncated tail, bad tag) is
//! reported as `CloakError::Authentication`; the caller aborts the whole file.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use cloak_core::config::MAX_CHUNK_SIZE;
use cloak_core::{CloakError, CloakResult};

use crate::kdf::SecretKey;
use crate::{LENGTH_SIZE, NONCE_SIZE, TAG_SIZE};

/// Nonce plus length field.
pub const FRAME_HEADER_SIZE: usize = NONCE_SIZE + LENGTH_SIZE;

/// Bytes a frame adds on top of its plaintext.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + TAG_SIZE;

/// Largest payload a content frame may declare.
pub const MAX_FRAME_PAYLOAD: usize = MAX_CHUNK_SIZE + TAG_SIZE;

/// Largest payload a one-shot sealed blob may declare.
const MAX_SEALED_PAYLOAD: usize = u32::MAX as usize;

/// Encrypt one plaintext chunk into a self-contained frame.
///
/// Returns `[24-byte nonce][u32 BE length][ciphertext + tag]`; the frame is
/// exactly `FRAME_OVERHEAD` bytes longer than `plaintext`.
pub fn encrypt_chunk(key: &SecretKey, plaintext: &[u8]) -> CloakResult<Vec<u8>> {
    if plaintext.len() > MAX_CHUNK_SIZE {
        return Err(CloakError::InvalidArgument(format!(
            "chunk of {} bytes exceeds the {MAX_CHUNK_SIZE}-byte frame limit",
            plaintext.len()
        )));
    }
    seal_frame(key, plaintext)
}

/// Authenticate and decrypt a single complete frame.
pub fn decrypt_chunk(key: &SecretKey, frame: &[u8]) -> CloakResult<Vec<u8>> {
    open_frame(key, frame, MAX_FRAME_PAYLOAD)
}

/// Seal an arbitrary blob (names, the metadata document) as one frame.
pub fn seal(key: &SecretKey, plaintext: &[u8]) -> CloakResult<Vec<u8>> {
    if plaintext.len() > MAX_SEALED_PAYLOAD - TAG_SIZE {
        return Err(CloakError::InvalidArgument(
            "blob too large for a 32-bit frame".into(),
        ));
    }
    seal_frame(key, plaintext)
}

/// Open a blob produced by [`seal`].
pub fn open(key: &SecretKey, frame: &[u8]) -> CloakResult<Vec<u8>> {
    open_frame(key, frame, MAX_SEALED_PAYLOAD)
}

fn seal_frame(key: &SecretKey, plaintext: &[u8]) -> CloakResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CloakError::Crypto(format!("chunk encryption failed: {e}")))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + ciphertext.len());
    frame.extend_from_slice(&nonce_bytes);
    frame.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

fn open_frame(key: &SecretKey, frame: &[u8], limit: usize) -> CloakResult<Vec<u8>> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(CloakError::Authentication);
    }
    let payload_len = declared_payload_len(frame, limit)?;
    if frame.len() != FRAME_HEADER_SIZE + payload_len {
        return Err(CloakError::Authentication);
    }

    let nonce = XNonce::from_slice(&frame[..NONCE_SIZE]);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(nonce, &frame[FRAME_HEADER_SIZE..])
        .map_err(|_| CloakError::Authentication)
}

/// Read the payload length from a frame header, rejecting impossible values.
fn declared_payload_len(header: &[u8], limit: usize) -> CloakResult<usize> {
    let mut len_bytes = [0u8; LENGTH_SIZE];
    len_bytes.copy_from_slice(&header[NONCE_SIZE..FRAME_HEADER_SIZE]);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len < TAG_SIZE || len > limit {
        return Err(CloakError::Authentication);
    }
    Ok(len)
}

/// Incremental frame decoder.
///
/// Bytes arrive in arbitrary windows; complete frames are decrypted as soon as
/// the declared payload is buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decrypt the next buffered frame, or `Ok(None)` if it is not complete yet.
    pub fn next_frame(&mut self, key: &SecretKey) -> CloakResult<Option<Vec<u8>>> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let total = FRAME_HEADER_SIZE + declared_payload_len(&self.buf, MAX_FRAME_PAYLOAD)?;
        if self.buf.len() < total {
            return Ok(None);
        }
        let plaintext = decrypt_chunk(key, &self.buf[..total])?;
        self.buf.drain(..total);
        Ok(Some(plaintext))
    }

    /// End of input: leftover bytes mean a truncated frame.
    pub fn finish(self) -> CloakResult<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(CloakError::Authentication)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_SIZE;
    use proptest::prelude::*;

    fn test_key() -> SecretKey {
        SecretKey::from_bytes([0x42u8; KEY_SIZE])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key();
        let plaintext = b"hello, encrypted world!";

        let frame = encrypt_chunk(&key, plaintext).unwrap();
        let decrypted = decrypt_chunk(&key, &frame).unwrap();

        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_encrypt_decrypt_empty() {
        let key = test_key();
        let frame = encrypt_chunk(&key, b"").unwrap();
        assert_eq!(frame.len(), FRAME_OVERHEAD);
        assert_eq!(decrypt_chunk(&key, &frame).unwrap(), b"");
    }

    #[test]
    fn test_frame_layout() {
        let key = test_key();
        let plaintext = vec![7u8; 1000];

        let frame = encrypt_chunk(&key, &plaintext).unwrap();

        // nonce (24) + length (4) + plaintext (1000) + tag (16) = 1044
        assert_eq!(frame.len(), 24 + 4 + 1000 + 16);
        let declared = u32::from_be_bytes(frame[24..28].try_into().unwrap());
        assert_eq!(declared as usize, 1000 + 16);
    }

    #[test]
    fn test_fresh_nonce_per_chunk() {
        let key = test_key();
        let a = encrypt_chunk(&key, b"same plaintext").unwrap();
        let b = encrypt_chunk(&key, b"same plaintext").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let frame = encrypt_chunk(&test_key(), b"secret data").unwrap();
        let other = SecretKey::from_bytes([0x24u8; KEY_SIZE]);
        assert!(matches!(
            decrypt_chunk(&other, &frame),
            Err(CloakError::Authentication)
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let key = test_key();
        let frame = encrypt_chunk(&key, b"secret data").unwrap();
        assert!(matches!(
            decrypt_chunk(&key, &frame[..frame.len() - 1]),
            Err(CloakError::Authentication)
        ));
        assert!(matches!(
            decrypt_chunk(&key, &frame[..10]),
            Err(CloakError::Authentication)
        ));
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let key = test_key();
        let big = vec![0u8; MAX_CHUNK_SIZE + 1];
        assert!(matches!(
            encrypt_chunk(&key, &big),
            Err(CloakError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_decoder_handles_split_windows() {
        let key = test_key();
        let mut stream = Vec::new();
        for chunk in [&b"first"[..], b"", b"third chunk"] {
            stream.extend(encrypt_chunk(&key, chunk).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for window in stream.chunks(7) {
            decoder.push(window);
            while let Some(pt) = decoder.next_frame(&key).unwrap() {
                out.push(pt);
            }
        }
        decoder.finish().unwrap();

        assert_eq!(out, vec![b"first".to_vec(), Vec::new(), b"third chunk".to_vec()]);
    }

    #[test]
    fn test_decoder_rejects_trailing_bytes() {
        let key = test_key();
        let mut stream = encrypt_chunk(&key, b"whole").unwrap();
        stream.extend_from_slice(&[1, 2, 3]);

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        assert_eq!(decoder.next_frame(&key).unwrap().unwrap(), b"whole");
        assert_eq!(decoder.next_frame(&key).unwrap(), None);
        assert_eq!(decoder.buffered(), 3);
        assert!(matches!(decoder.finish(), Err(CloakError::Authentication)));
    }

    #[test]
    fn test_decoder_rejects_absurd_length() {
        let key = test_key();
        let mut frame = encrypt_chunk(&key, b"data").unwrap();
        frame[NONCE_SIZE..FRAME_HEADER_SIZE].copy_from_slice(&u32::MAX.to_be_bytes());

        let mut decoder = FrameDecoder::new();
        decoder.push(&frame);
        assert!(matches!(
            decoder.next_frame(&key),
            Err(CloakError::Authentication)
        ));
    }

    #[test]
    fn test_seal_open_blob() {
        let key = test_key();
        let sealed = seal(&key, b"{\"items\":{}}").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"{\"items\":{}}");
    }

    proptest! {
        #[test]
        fn roundtrip_any_chunk(data in proptest::collection::vec(any::<u8>(), 0..=4096)) {
            let key = test_key();
            let frame = encrypt_chunk(&key, &data).unwrap();
            prop_assert_eq!(frame.len(), data.len() + FRAME_OVERHEAD);
            prop_assert_eq!(decrypt_chunk(&key, &frame).unwrap(), data);
        }

        #[test]
        fn any_flipped_byte_fails_authentication(
            data in proptest::collection::vec(any::<u8>(), 0..=512),
            pos in any::<prop::sample::Index>(),
            mask in 1u8..=255,
        ) {
            let key = test_key();
            let mut frame = encrypt_chunk(&key, &data).unwrap();
            let i = pos.index(frame.len());
            frame[i] ^= mask;

            let mut decoder = FrameDecoder::new();
            decoder.push(&frame);
            let outcome = decoder
                .next_frame(&key)
                .and_then(|pt| decoder.finish().map(|_| pt));
            prop_assert!(
                matches!(outcome, Err(CloakError::Authentication)),
                "flipping byte {} must fail authentication", i
            );
        }
    }
}

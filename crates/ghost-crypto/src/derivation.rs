//! Per-chunk key derivation for voice payloads using HKDF

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{aead::KEY_SIZE, exchange::SharedSessionKey};

/// Label used for voice chunk key derivation
const VOICE_CHUNK_LABEL: &[u8] = b"ghostlineVoiceChunkV1";

/// Constant all-zero HKDF salt. Domain separation comes from the info string.
const ZERO_SALT: [u8; 32] = [0u8; 32];

/// Key for a single voice chunk.
///
/// Used for exactly one chunk and zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ChunkKey([u8; KEY_SIZE]);

impl ChunkKey {
    /// 32-byte AES-256-GCM key.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Derive the key for one voice chunk from the session key.
///
/// The info parameter is `label || chunk_index || capture_timestamp`, so
/// every (capture, chunk) pair gets an independent key.
///
/// # Security
///
/// - Different chunk indices produce different keys (sibling isolation)
/// - Different captures produce different keys even at the same index
/// - The session key cannot be recovered from any chunk key (HKDF is
///   one-way)
/// - Deterministic: both peers derive the same key for the same chunk
pub fn derive_chunk_key(
    session_key: &SharedSessionKey,
    chunk_index: u32,
    capture_timestamp: u64,
) -> ChunkKey {
    let hkdf = Hkdf::<Sha256>::new(Some(&ZERO_SALT), session_key.as_bytes());

    // Capacity: 21 (label) + 4 (chunk_index) + 8 (capture_timestamp) = 33
    let mut info = Vec::with_capacity(VOICE_CHUNK_LABEL.len() + 12);
    info.extend_from_slice(VOICE_CHUNK_LABEL);
    info.extend_from_slice(&chunk_index.to_be_bytes());
    info.extend_from_slice(&capture_timestamp.to_be_bytes());

    let mut key = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(&info, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    ChunkKey(key)
}

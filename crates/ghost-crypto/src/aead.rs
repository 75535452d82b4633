//! Payload encryption using AES-256-GCM
//!
//! All functions are pure - nonces must be provided by the caller. The
//! stateful engine that draws nonces and enforces uniqueness lives in
//! `ghost-core`.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};

use crate::error::CryptoError;

/// AES-256 key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// GCM nonce size (96 bits)
pub const NONCE_SIZE: usize = 12;

/// GCM tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext` under `key` with `nonce`.
///
/// Returns the ciphertext with the 16-byte tag appended.
///
/// # Security
///
/// The caller MUST NOT reuse a nonce under the same key. Reuse under GCM
/// leaks the XOR of plaintexts and enables tag forgery.
pub fn seal(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(key.into());

    let Ok(ciphertext) = cipher.encrypt(Nonce::from_slice(nonce), plaintext) else {
        unreachable!("AES-256-GCM encryption cannot fail for in-memory payloads");
    };

    ciphertext
}

/// Decrypt `ciphertext` (tag appended) under `key` with `nonce`.
///
/// # Errors
///
/// - `DecryptionFailed`: tag mismatch. The error deliberately carries no
///   detail about whether key, nonce or ciphertext was wrong.
pub fn open(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(key.into());

    cipher.decrypt(Nonce::from_slice(nonce), ciphertext).map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_SIZE] = [0x11; KEY_SIZE];
    const NONCE: [u8; NONCE_SIZE] = [0x22; NONCE_SIZE];

    #[test]
    fn seal_open_roundtrip() {
        let ciphertext = seal(&KEY, &NONCE, b"Hello, World!");
        let plaintext = open(&KEY, &NONCE, &ciphertext).unwrap();

        assert_eq!(plaintext, b"Hello, World!");
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let ciphertext = seal(&KEY, &NONCE, b"");
        assert_eq!(ciphertext.len(), TAG_SIZE);
        assert_eq!(open(&KEY, &NONCE, &ciphertext).unwrap(), b"");
    }

    #[test]
    fn ciphertext_is_plaintext_plus_tag() {
        let ciphertext = seal(&KEY, &NONCE, b"test message");
        assert_eq!(ciphertext.len(), b"test message".len() + TAG_SIZE);
    }

    #[test]
    fn wrong_key_fails() {
        let ciphertext = seal(&KEY, &NONCE, b"secret");
        let result = open(&[0x12; KEY_SIZE], &NONCE, &ciphertext);

        assert_eq!(result, Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn wrong_nonce_fails() {
        let ciphertext = seal(&KEY, &NONCE, b"secret");
        let result = open(&KEY, &[0x23; NONCE_SIZE], &ciphertext);

        assert_eq!(result, Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let mut ciphertext = seal(&KEY, &NONCE, b"original message");
        ciphertext[0] ^= 0xFF;

        assert_eq!(open(&KEY, &NONCE, &ciphertext), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let ciphertext = seal(&KEY, &NONCE, b"original message");

        assert!(open(&KEY, &NONCE, &ciphertext[..TAG_SIZE - 1]).is_err());
    }

    #[test]
    fn different_nonces_produce_different_ciphertexts() {
        let a = seal(&KEY, &[0x00; NONCE_SIZE], b"same");
        let b = seal(&KEY, &[0xFF; NONCE_SIZE], b"same");

        assert_ne!(a, b);
    }
}

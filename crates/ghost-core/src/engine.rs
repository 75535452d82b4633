//! Session-key AEAD engine.
//!
//! Binds the shared session key and seals payloads under it with a fresh
//! random nonce per call. Every nonce issued under the current key is
//! remembered, and a repeat draw is discarded, so a nonce never repeats for a
//! key even when the RNG misbehaves.

use std::collections::HashSet;

use ghost_crypto::{CryptoError, NONCE_SIZE, SharedSessionKey, open, seal};

use crate::env::Environment;

/// Draws allowed before giving up on finding an unused nonce.
const MAX_NONCE_DRAWS: usize = 16;

/// Ciphertext with the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    /// AES-256-GCM output (tag appended)
    pub ciphertext: Vec<u8>,
    /// Nonce used for this payload
    pub nonce: [u8; NONCE_SIZE],
}

impl SealedPayload {
    /// Message id this payload will carry on the wire (hex nonce).
    pub fn message_id(&self) -> String {
        hex::encode(self.nonce)
    }
}

/// AES-256-GCM engine for one session.
pub struct CryptoEngine<E: Environment> {
    env: E,
    key: Option<SharedSessionKey>,
    issued_nonces: HashSet<[u8; NONCE_SIZE]>,
}

impl<E: Environment> CryptoEngine<E> {
    /// Engine with no key bound.
    pub fn new(env: E) -> Self {
        Self { env, key: None, issued_nonces: HashSet::new() }
    }

    /// Bind `key`. Replacing a key forgets the nonces issued under the old one.
    pub fn initialize(&mut self, key: SharedSessionKey) {
        self.issued_nonces.clear();
        self.key = Some(key);
    }

    /// Whether a key is bound.
    pub fn is_initialized(&self) -> bool {
        self.key.is_some()
    }

    /// The bound key, for components deriving sub-keys from it.
    pub fn session_key(&self) -> Option<&SharedSessionKey> {
        self.key.as_ref()
    }

    /// Seal `plaintext` under a fresh nonce.
    ///
    /// # Errors
    ///
    /// - `UninitializedKey` if no key is bound
    /// - `InvalidKeyMaterial` if the RNG keeps returning issued nonces
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<SealedPayload, CryptoError> {
        let Some(key) = self.key.as_ref() else {
            return Err(CryptoError::UninitializedKey);
        };

        for _ in 0..MAX_NONCE_DRAWS {
            let nonce: [u8; NONCE_SIZE] = self.env.random_array();
            if !self.issued_nonces.insert(nonce) {
                tracing::warn!("nonce collision under current key, redrawing");
                continue;
            }

            return Ok(SealedPayload { ciphertext: seal(key.as_bytes(), &nonce, plaintext), nonce });
        }

        Err(CryptoError::InvalidKeyMaterial)
    }

    /// Open `ciphertext` sealed under `nonce`.
    ///
    /// # Errors
    ///
    /// - `UninitializedKey` if no key is bound
    /// - `DecryptionFailed` on tamper, wrong key or wrong nonce
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, CryptoError> {
        let Some(key) = self.key.as_ref() else {
            return Err(CryptoError::UninitializedKey);
        };

        open(key.as_bytes(), nonce, ciphertext)
    }

    /// Drop the key (zeroized on drop) and forget issued nonces.
    pub fn release(&mut self) {
        self.key = None;
        self.issued_nonces.clear();
    }

    /// Number of nonces issued under the current key.
    pub fn issued_count(&self) -> usize {
        self.issued_nonces.len()
    }
}

impl<E: Environment> std::fmt::Debug for CryptoEngine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("initialized", &self.is_initialized())
            .field("issued_nonces", &self.issued_nonces.len())
            .finish()
    }
}

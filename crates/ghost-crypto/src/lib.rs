//! Ghostline Cryptographic Primitives
//!
//! Cryptographic building blocks for Ghostline sessions. Pure functions with
//! deterministic outputs. Callers provide random bytes, which keeps every
//! primitive reproducible under test.
//!
//! # Key Lifecycle
//!
//! Each session generates a fresh P-256 key pair on both sides. Public keys
//! are exchanged over the channel and each side computes the same ECDH
//! secret, which becomes the session key. Chat payloads are sealed directly
//! under the session key. Voice chunks get their own key derived with HKDF
//! from the session key and the chunk's position in the capture.
//!
//! ```text
//! Ephemeral P-256 key pair (per session, per participant)
//!        │
//!        ▼
//! ECDH(local secret, peer public) → Session Key
//!        │                               │
//!        ▼                               ▼
//! AES-256-GCM (chat payloads)     HKDF → Chunk Key (per voice chunk)
//!                                        │
//!                                        ▼
//!                                 AES-256-GCM (voice chunk)
//! ```
//!
//! # Security
//!
//! Ephemerality:
//! - Key pairs never leave memory and are zeroized on drop
//! - Session keys are zeroized on drop; no key is reused across sessions
//!
//! Chunk Isolation:
//! - Chunk keys are bound to (chunk index, capture timestamp)
//! - Compromising one chunk key exposes neither siblings nor the session key
//!
//! Authenticity:
//! - AES-256-GCM rejects tampered ciphertext, wrong keys and wrong nonces
//! - Failures carry no detail about which check failed
//!
//! Deniability:
//! - A hidden volume opens to the decoy or the real content depending on the
//!   password; without the inner password the real slot is indistinguishable
//!   from noise

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod derivation;
mod error;
pub mod exchange;
pub mod hidden_volume;

pub use aead::{KEY_SIZE, NONCE_SIZE, TAG_SIZE, open, seal};
pub use derivation::{ChunkKey, derive_chunk_key};
pub use error::CryptoError;
pub use exchange::{
    FINGERPRINT_LEN, Fingerprint, KeyPair, PUBLIC_KEY_SIZE, PublicKeyBytes, SharedSessionKey,
    derive_shared_secret, fingerprint,
};
pub use hidden_volume::{
    HiddenVolume, HiddenVolumeParams, MAX_ITERATIONS, MIN_ITERATIONS, SALT_SIZE, VolumeContent,
    VolumeEntropy,
};

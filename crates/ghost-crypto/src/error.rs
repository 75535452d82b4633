//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors produced by the cryptographic primitives.
///
/// None of these are retried by callers. A failed authentication means
/// corruption or an active attack, and masking it with a retry would hide
/// both.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption or decryption attempted before a key was bound.
    #[error("no session key bound")]
    UninitializedKey,

    /// AEAD authentication failed (tampering, wrong key or wrong nonce).
    #[error("decryption failed: authentication failed")]
    DecryptionFailed,

    /// Peer public key is not a valid P-256 point.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Random input could not be turned into a key (e.g. zero scalar).
    #[error("invalid key material")]
    InvalidKeyMaterial,

    /// Hidden volume passwords must differ.
    #[error("outer and inner passwords must differ")]
    IdenticalPasswords,

    /// Password stretching configured below the minimum work factor.
    #[error("iteration count {iterations} below minimum {minimum}")]
    WeakIterationCount {
        /// Requested iteration count
        iterations: u32,
        /// Minimum accepted iteration count
        minimum: u32,
    },

    /// Password stretching demands more work than any volume may ask for.
    #[error("iteration count {iterations} above maximum {maximum}")]
    ExcessiveIterationCount {
        /// Requested iteration count
        iterations: u32,
        /// Maximum accepted iteration count
        maximum: u32,
    },

    /// Serialized form could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(String),
}

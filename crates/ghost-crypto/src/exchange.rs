//! Ephemeral P-256 key exchange and public key fingerprints
//!
//! # Security Properties
//!
//! - Ephemerality: key pairs are generated per session and zeroized on drop
//! - Symmetry: ECDH(A, B_pub) == ECDH(B, A_pub), so both sides derive the same
//!   session key without it crossing the wire
//! - Fingerprints are a deterministic function of the public key alone

use std::fmt;

use p256::{
    FieldBytes, PublicKey, SecretKey, ecdh::diffie_hellman, elliptic_curve::sec1::ToEncodedPoint,
};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{aead::KEY_SIZE, error::CryptoError};

/// Size of an uncompressed SEC1 P-256 public key (0x04 || X || Y)
pub const PUBLIC_KEY_SIZE: usize = 65;

/// Number of hex characters in a fingerprint
pub const FINGERPRINT_LEN: usize = 8;

/// Bytes of the public key hash kept in the fingerprint
const FINGERPRINT_BYTES: usize = FINGERPRINT_LEN / 2;

/// Attempts before giving up on rejection sampling a secret scalar.
///
/// A uniformly random 32-byte string is a valid P-256 scalar with probability
/// ~1 - 2^-32, so hitting this limit means the random source is broken.
const MAX_KEYGEN_ATTEMPTS: usize = 8;

/// Ephemeral P-256 key pair.
///
/// Owned by exactly one session. The secret scalar is zeroized on drop by
/// the underlying `SecretKey`.
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKeyBytes,
}

impl KeyPair {
    /// Generate a key pair from caller-provided randomness.
    ///
    /// `fill` is asked for 32 random bytes per attempt. Production callers
    /// pass the OS CSPRNG; tests pass a seeded generator.
    ///
    /// # Errors
    ///
    /// - `InvalidKeyMaterial` if `fill` never yields a valid scalar
    pub fn generate(mut fill: impl FnMut(&mut [u8])) -> Result<Self, CryptoError> {
        let mut candidate = [0u8; KEY_SIZE];

        for _ in 0..MAX_KEYGEN_ATTEMPTS {
            fill(&mut candidate);
            let result = Self::from_secret_bytes(&candidate);
            candidate.zeroize();

            if let Ok(key_pair) = result {
                return Ok(key_pair);
            }
        }

        Err(CryptoError::InvalidKeyMaterial)
    }

    /// Build a key pair from a raw 32-byte secret scalar.
    ///
    /// # Errors
    ///
    /// - `InvalidKeyMaterial` if the bytes are zero or not below the curve
    ///   order
    pub fn from_secret_bytes(bytes: &[u8; KEY_SIZE]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_bytes(FieldBytes::from_slice(bytes))
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;
        let public = PublicKeyBytes::from_public_key(&secret.public_key());

        Ok(Self { secret, public })
    }

    /// Exported public key (uncompressed SEC1).
    pub fn public_key(&self) -> &PublicKeyBytes {
        &self.public
    }

    /// Fingerprint of our own public key.
    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint(&self.public)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.fingerprint()).finish_non_exhaustive()
    }
}

/// Validated, exported P-256 public key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKeyBytes(Vec<u8>);

impl PublicKeyBytes {
    /// Parse and validate a SEC1-encoded public key.
    ///
    /// Compressed input is accepted and normalized to the uncompressed form so
    /// fingerprints do not depend on the peer's encoding choice.
    ///
    /// # Errors
    ///
    /// - `InvalidPublicKey` if the bytes are not a point on P-256
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let public = PublicKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self::from_public_key(&public))
    }

    fn from_public_key(public: &PublicKey) -> Self {
        Self(public.to_encoded_point(false).as_bytes().to_vec())
    }

    /// Raw uncompressed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn to_public_key(&self) -> Result<PublicKey, CryptoError> {
        PublicKey::from_sec1_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)
    }
}

impl fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyBytes({})", fingerprint(self))
    }
}

/// Symmetric key shared by both participants of a session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSessionKey([u8; KEY_SIZE]);

impl SharedSessionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedSessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSessionKey(<redacted>)")
    }
}

/// Derive the session key from our secret and the peer's public key.
///
/// Commutative in effect: `derive(A, B_pub)` equals `derive(B, A_pub)`.
///
/// # Errors
///
/// - `InvalidPublicKey` if `remote` fails point validation
pub fn derive_shared_secret(
    local: &KeyPair,
    remote: &PublicKeyBytes,
) -> Result<SharedSessionKey, CryptoError> {
    let remote = remote.to_public_key()?;
    let shared = diffie_hellman(local.secret.to_nonzero_scalar(), remote.as_affine());

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(shared.raw_secret_bytes().as_slice());

    Ok(SharedSessionKey(key))
}

/// Short digest of a public key for out-of-band comparison.
///
/// First 4 bytes of SHA-256 over the exported key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_BYTES]);

impl Fingerprint {
    /// 8 uppercase hex characters, ungrouped.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

/// Displays as two groups of four, e.g. `1A2B 3C4D`.
impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        let (left, right) = hex.split_at(FINGERPRINT_LEN / 2);
        write!(f, "{left} {right}")
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Compute the fingerprint of a public key.
pub fn fingerprint(public_key: &PublicKeyBytes) -> Fingerprint {
    let digest = Sha256::digest(public_key.as_bytes());

    let mut bytes = [0u8; FINGERPRINT_BYTES];
    bytes.copy_from_slice(&digest[..FINGERPRINT_BYTES]);
    Fingerprint(bytes)
}

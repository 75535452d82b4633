//! Two-password deniable encryption ("hidden volume")
//!
//! A volume carries two AES-256-GCM slots under one shared salt. The outer
//! slot holds a decoy, the inner slot holds the real content. Each password is
//! stretched with PBKDF2-HMAC-SHA256 into its own key, so a password opens at
//! most the slot it was used to seal.
//!
//! ```text
//! outer password ─PBKDF2(salt)─▶ outer key ─AES-GCM(outer nonce)─▶ decoy slot
//! inner password ─PBKDF2(salt)─▶ inner key ─AES-GCM(inner nonce)─▶ real slot
//! ```
//!
//! Opening checks the inner slot first. Supplying the inner password can
//! therefore never fall through to the decoy.

use std::fmt;

use hmac::Hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    aead::{KEY_SIZE, NONCE_SIZE, open, seal},
    error::CryptoError,
};

/// Minimum PBKDF2 iteration count accepted for creating or opening a volume.
pub const MIN_ITERATIONS: u32 = 100_000;

/// Maximum PBKDF2 iteration count. Bounds the work an imported volume can
/// demand before any password is checked.
pub const MAX_ITERATIONS: u32 = 10_000_000;

/// Size of the shared PBKDF2 salt
pub const SALT_SIZE: usize = 16;

/// Password stretching parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HiddenVolumeParams {
    /// PBKDF2 iteration count, within [`MIN_ITERATIONS`]..=[`MAX_ITERATIONS`]
    pub iterations: u32,
}

impl Default for HiddenVolumeParams {
    fn default() -> Self {
        Self { iterations: MIN_ITERATIONS }
    }
}

/// Caller-provided randomness for [`HiddenVolume::create`].
#[derive(Debug, Clone, Copy)]
pub struct VolumeEntropy {
    /// Shared PBKDF2 salt
    pub salt: [u8; SALT_SIZE],
    /// Nonce for the decoy slot
    pub outer_nonce: [u8; NONCE_SIZE],
    /// Nonce for the real slot
    pub inner_nonce: [u8; NONCE_SIZE],
}

impl VolumeEntropy {
    /// Draw all fields from `fill`.
    pub fn generate(mut fill: impl FnMut(&mut [u8])) -> Self {
        let mut entropy =
            Self { salt: [0; SALT_SIZE], outer_nonce: [0; NONCE_SIZE], inner_nonce: [0; NONCE_SIZE] };
        fill(&mut entropy.salt);
        fill(&mut entropy.outer_nonce);
        fill(&mut entropy.inner_nonce);
        entropy
    }
}

/// Encrypted two-slot volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenVolume {
    /// Decoy ciphertext (tag appended)
    pub outer_ciphertext: Vec<u8>,
    /// Decoy nonce
    pub outer_nonce: [u8; NONCE_SIZE],
    /// Real ciphertext (tag appended)
    pub inner_ciphertext: Vec<u8>,
    /// Real nonce
    pub inner_nonce: [u8; NONCE_SIZE],
    /// Shared PBKDF2 salt
    pub salt: [u8; SALT_SIZE],
    /// PBKDF2 iteration count used for both keys
    pub iterations: u32,
}

/// Plaintext recovered from a volume.
#[derive(PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct VolumeContent {
    /// Recovered plaintext
    pub content: Vec<u8>,
    /// `true` if the outer (decoy) slot was opened
    pub is_decoy: bool,
}

impl fmt::Debug for VolumeContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeContent")
            .field("len", &self.content.len())
            .field("is_decoy", &self.is_decoy)
            .finish()
    }
}

/// Stretched password key, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct PasswordKey([u8; KEY_SIZE]);

fn check_iterations(iterations: u32) -> Result<(), CryptoError> {
    if iterations < MIN_ITERATIONS {
        return Err(CryptoError::WeakIterationCount { iterations, minimum: MIN_ITERATIONS });
    }
    if iterations > MAX_ITERATIONS {
        return Err(CryptoError::ExcessiveIterationCount { iterations, maximum: MAX_ITERATIONS });
    }
    Ok(())
}

fn stretch(password: &str, salt: &[u8; SALT_SIZE], iterations: u32) -> PasswordKey {
    let mut key = [0u8; KEY_SIZE];
    let Ok(()) = pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, iterations, &mut key)
    else {
        unreachable!("HMAC-SHA256 accepts keys of any length");
    };
    PasswordKey(key)
}

impl HiddenVolume {
    /// Seal `real` under `inner_password` and `decoy` under `outer_password`.
    ///
    /// # Errors
    ///
    /// - `IdenticalPasswords` if both passwords are equal
    /// - `WeakIterationCount` if `params.iterations` < [`MIN_ITERATIONS`]
    /// - `ExcessiveIterationCount` if `params.iterations` > [`MAX_ITERATIONS`]
    pub fn create(
        real: &[u8],
        decoy: &[u8],
        outer_password: &str,
        inner_password: &str,
        params: HiddenVolumeParams,
        entropy: VolumeEntropy,
    ) -> Result<Self, CryptoError> {
        if outer_password == inner_password {
            return Err(CryptoError::IdenticalPasswords);
        }

        check_iterations(params.iterations)?;

        let outer_key = stretch(outer_password, &entropy.salt, params.iterations);
        let inner_key = stretch(inner_password, &entropy.salt, params.iterations);

        Ok(Self {
            outer_ciphertext: seal(&outer_key.0, &entropy.outer_nonce, decoy),
            outer_nonce: entropy.outer_nonce,
            inner_ciphertext: seal(&inner_key.0, &entropy.inner_nonce, real),
            inner_nonce: entropy.inner_nonce,
            salt: entropy.salt,
            iterations: params.iterations,
        })
    }

    /// Open the volume with `password`.
    ///
    /// Returns the real content for the inner password, the decoy for the
    /// outer password, and `None` otherwise. A volume whose recorded
    /// iteration count is out of bounds never opens.
    pub fn open(&self, password: &str) -> Option<VolumeContent> {
        if check_iterations(self.iterations).is_err() {
            return None;
        }

        let key = stretch(password, &self.salt, self.iterations);

        if let Ok(content) = open(&key.0, &self.inner_nonce, &self.inner_ciphertext) {
            return Some(VolumeContent { content, is_decoy: false });
        }

        open(&key.0, &self.outer_nonce, &self.outer_ciphertext)
            .ok()
            .map(|content| VolumeContent { content, is_decoy: true })
    }

    /// Serialize to CBOR for export.
    ///
    /// # Errors
    ///
    /// - `Encoding` if serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR.
    ///
    /// # Errors
    ///
    /// - `Encoding` if the bytes are not a valid volume
    /// - `WeakIterationCount` / `ExcessiveIterationCount` if the recorded
    ///   iteration count is out of bounds
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let volume: Self =
            ciborium::from_reader(bytes).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        check_iterations(volume.iterations)?;
        Ok(volume)
    }
}

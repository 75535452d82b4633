//! Session and participant identifiers.
//!
//! [`SessionId`] names a session on the channel and in the registry, in the
//! form `GHOST-XXXX-XXXX`. [`SessionIdentity`] distinguishes the two
//! participants in a presence roster. It is salted per session, so it never
//! links two sessions of the same device.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{env::Environment, error::IdentityError};

const SESSION_ID_PREFIX: &str = "GHOST";

const SESSION_ID_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Characters per group after the prefix.
const GROUP_LEN: usize = 4;

/// Largest multiple of the alphabet size that fits in a byte. Bytes at or
/// above it are redrawn so every character is equally likely.
const REJECTION_BOUND: u8 = 252;

/// Salt length for [`SessionIdentity`] derivation.
pub const IDENTITY_SALT_SIZE: usize = 16;

/// Hex characters kept from the identity digest.
const IDENTITY_HEX_LEN: usize = 16;

/// Session name of the form `GHOST-XXXX-XXXX` over `[A-Z0-9]`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Draw a fresh session id from the environment's RNG.
    pub fn generate<E: Environment>(env: &E) -> Self {
        let mut chars = [0u8; GROUP_LEN * 2];
        let mut filled = 0;

        while filled < chars.len() {
            let mut byte = [0u8; 1];
            env.random_bytes(&mut byte);
            if byte[0] < REJECTION_BOUND {
                chars[filled] = SESSION_ID_ALPHABET[usize::from(byte[0]) % SESSION_ID_ALPHABET.len()];
                filled += 1;
            }
        }

        let (left, right) = chars.split_at(GROUP_LEN);
        Self(format!(
            "{SESSION_ID_PREFIX}-{}-{}",
            String::from_utf8_lossy(left),
            String::from_utf8_lossy(right)
        ))
    }

    /// Validate `raw` against the exact pattern.
    ///
    /// # Errors
    ///
    /// - `InvalidSessionId` if `raw` is not `GHOST-XXXX-XXXX`
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let invalid = || IdentityError::InvalidSessionId(raw.to_string());

        let mut parts = raw.split('-');
        let (Some(prefix), Some(left), Some(right), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        if prefix != SESSION_ID_PREFIX {
            return Err(invalid());
        }

        let group_ok = |group: &str| {
            group.len() == GROUP_LEN && group.bytes().all(|b| SESSION_ID_ALPHABET.contains(&b))
        };

        if !group_ok(left) || !group_ok(right) {
            return Err(invalid());
        }

        Ok(Self(raw.to_string()))
    }

    /// The id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// Opaque per-session participant identifier.
///
/// SHA-256 over device attributes and a fresh salt, hex-encoded and truncated
/// to 16 characters. Only used to tell self from peer in presence rosters.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionIdentity(String);

impl SessionIdentity {
    /// Derive an identity from `attributes` and `salt`.
    pub fn derive(attributes: &[&str], salt: &[u8; IDENTITY_SALT_SIZE]) -> Self {
        let mut hasher = Sha256::new();
        for attribute in attributes {
            hasher.update(attribute.as_bytes());
            hasher.update(b"|");
        }
        hasher.update(salt);

        let mut hex = hex::encode(hasher.finalize());
        hex.truncate(IDENTITY_HEX_LEN);
        Self(hex)
    }

    /// Derive an identity with a salt drawn from the environment.
    pub fn generate<E: Environment>(env: &E, attributes: &[&str]) -> Self {
        let salt: [u8; IDENTITY_SALT_SIZE] = env.random_array();
        Self::derive(attributes, &salt)
    }

    /// Wrap an identity received from the channel.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The identity as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionIdentity({})", self.0)
    }
}

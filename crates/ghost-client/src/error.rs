//! Session and collaborator errors.

use ghost_core::{IdentityError, TransportError, VoiceError, WireError};
use ghost_crypto::CryptoError;
use thiserror::Error;

/// Errors returned by the session registry.
///
/// Each variant has a stable [`code`](RegistryError::code) so the caller can
/// tell them apart without parsing messages. Registry calls are attempted once
/// and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Registry unreachable
    #[error("registry unreachable: {0}")]
    Network(String),

    /// Too many requests
    #[error("registry rate limit exceeded")]
    RateLimited,

    /// Registry refused the request
    #[error("registry rejected request: {0}")]
    Rejected(String),
}

impl RegistryError {
    /// Stable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "NETWORK",
            Self::RateLimited => "RATE_LIMITED",
            Self::Rejected(_) => "REJECTED",
        }
    }
}

/// Errors reported by a channel implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Channel is not subscribed or was shut down
    #[error("channel closed")]
    Closed,

    /// Relay reported an error
    #[error("channel failure: {0}")]
    Failed(String),
}

/// Errors surfaced by the session controller and runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Fingerprints have not been confirmed
    #[error("channel not verified: confirm fingerprints first")]
    UnverifiedChannel,

    /// Key exchange has not completed
    #[error("session not ready")]
    NotReady,

    /// Session has been terminated
    #[error("session terminated")]
    Terminated,

    /// No such message in this session
    #[error("message not found: {0}")]
    MessageNotFound(String),

    /// The runtime owning the session has stopped
    #[error("session runtime stopped")]
    RuntimeStopped,

    /// Background task failed
    #[error("task failed: {0}")]
    Task(String),

    /// Cryptographic failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Registry failure
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Voice failure
    #[error(transparent)]
    Voice(#[from] VoiceError),

    /// Encoding failure
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Malformed identifier
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

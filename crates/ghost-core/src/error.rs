//! Error types for the Ghostline protocol core.
//!
//! Strongly-typed errors per layer: transport errors (timeouts, channel
//! failures, state transitions), voice playback errors, identifier parsing,
//! and wire encoding.

use std::time::Duration;

use ghost_crypto::CryptoError;
use thiserror::Error;

use crate::transport::TransportStatus;

/// Errors that can occur in the transport state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Subscribe attempt did not complete in time
    #[error("subscribe timeout after {timeout:?}")]
    SubscribeTimeout {
        /// Configured per-attempt timeout
        timeout: Duration,
    },

    /// The external channel reported a failure
    #[error("channel failure: {0}")]
    ChannelFailure(String),

    /// Every attempt in the retry budget failed
    #[error("connection failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made (initial + retries)
        attempts: u32,
        /// Error from the final attempt
        last: Box<TransportError>,
    },

    /// The session registry rejected or could not confirm the session
    #[error("session validation failed: {0}")]
    ValidationFailed(String),

    /// Invalid state transition attempted
    #[error("invalid state transition: cannot {operation} from {status:?}")]
    InvalidState {
        /// Current status when error occurred
        status: TransportStatus,
        /// Operation that was attempted
        operation: &'static str,
    },
}

impl TransportError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Only timeouts and channel failures are retried. An exhausted budget,
    /// a failed validation or a state violation is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SubscribeTimeout { .. } | Self::ChannelFailure(_))
    }
}

/// Errors produced by voice capture and playback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    /// Message was already played once in this session
    #[error("voice message {message_id} was already played")]
    ReplayViolation {
        /// Identifier of the consumed message
        message_id: String,
    },

    /// The per-session played-id set is full
    #[error("playback limit of {limit} messages reached for this session")]
    PlaybackLimit {
        /// Configured maximum number of played ids
        limit: usize,
    },

    /// Key missing or chunk failed authentication
    #[error("voice crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Chunk sequence is not contiguous or payload is undecodable
    #[error("malformed voice message: {0}")]
    Malformed(String),

    /// Audio output reported a failure
    #[error("audio output error: {0}")]
    Output(String),
}

/// Errors parsing identifiers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Session id does not match `GHOST-XXXX-XXXX`
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),
}

/// Errors encoding or decoding wire payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Serialization failed
    #[error("encode failed: {0}")]
    Encode(String),

    /// Bytes are not a valid payload
    #[error("decode failed: {0}")]
    Decode(String),
}

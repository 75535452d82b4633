//! Ghostline protocol core
//!
//! Sans-IO building blocks for one ephemeral two-party session: the session
//! key engine, voice capture and playback, the connection state machine, the
//! RAM-only message queue and the channel envelope format.
//!
//! Nothing in this crate performs I/O or reads a clock. State machines take
//! `now` as a parameter and return actions; randomness and time come from an
//! [`Environment`]. The client crate wires these into a controller and an
//! async runtime.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod env;
pub mod error;
pub mod identity;
pub mod queue;
pub mod timer;
pub mod transport;
pub mod voice;
pub mod wire;

#[cfg(test)]
mod test_support;

pub use engine::{CryptoEngine, SealedPayload};
pub use env::Environment;
pub use error::{IdentityError, TransportError, VoiceError, WireError};
pub use identity::{IDENTITY_SALT_SIZE, SessionId, SessionIdentity};
pub use queue::{MemoryStats, MessageKind, MessageQueue, QueuedMessage, Sender};
pub use timer::Timers;
pub use transport::{
    ConnectionState, Transport, TransportAction, TransportConfig, TransportEvent, TransportStatus,
};
pub use voice::{
    AudioOutput, DEFAULT_MAX_PLAYED_IDS, EncryptedChunk, Playback, PlaybackReport, VoiceCapture,
    VoiceMessage, VoicePipeline,
};
pub use wire::{ChatKind, ChatPayload, Envelope, EnvelopeKind};

//! Ghostline session client
//!
//! Runs one ephemeral, end-to-end encrypted session between two participants.
//!
//! # Architecture
//!
//! ```text
//! Application ──SessionHandle──> Runtime ──events──> SessionController
//!      ↑                            │   <──actions──         │
//!      └────── SessionNotice ───────┤                        ├─ CryptoEngine
//!                                   │                        ├─ VoicePipeline
//!                                   ├─ Channel (relay)       ├─ Transport
//!                                   ├─ SessionRegistry       └─ MessageQueue
//!                                   └─ LocalMarkers
//! ```
//!
//! The [`SessionController`] is a pure state machine: it owns key material,
//! the message queue slice and the connection state, and turns events into
//! actions. The [`Runtime`] owns the I/O and executes those actions
//! against the external collaborators, which are traits so the same code
//! runs against a hosted relay or the in-memory simulation.
//!
//! # Session Flow
//!
//! 1. Validate the session id with the registry, subscribe, track presence
//! 2. Broadcast our public key; derive the session key from the peer's
//! 3. Show both fingerprints; sending is refused until the user confirms
//! 4. Exchange sealed chat, file and one-time voice messages, each acked
//! 5. Terminate: goodbye broadcast, registry delete, local zeroization

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod markers;
pub mod registry;
pub mod runtime;
pub mod system_env;
pub mod volume;

#[cfg(test)]
mod test_support;

pub use channel::{Channel, ChannelEvent};
pub use config::{SessionConfig, VerificationPolicy};
pub use controller::SessionController;
pub use error::{ChannelError, RegistryError, SessionError};
pub use event::{
    Outgoing, SessionAction, SessionEvent, SessionNotice, SessionPhase, SessionSnapshot,
    TerminationReason,
};
pub use markers::{LocalMarkers, Marker, MemoryMarkers};
pub use registry::SessionRegistry;
pub use runtime::{Runtime, SessionHandle, create_session, join_session};
pub use system_env::SystemEnv;
pub use volume::{create_hidden_volume, open_hidden_volume};

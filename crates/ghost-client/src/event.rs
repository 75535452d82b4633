//! Session events, actions and notices.

use ghost_core::{
    ConnectionState, Envelope, MemoryStats, MessageKind, SessionId, SessionIdentity,
    TransportError,
};
use ghost_crypto::Fingerprint;

use crate::markers::Marker;

/// Events the caller feeds into the controller.
///
/// The caller is responsible for:
/// - Reporting the outcome of every action it executed
/// - Forwarding channel deliveries
/// - Driving time forward via ticks
///
/// Generic over `I` (Instant type) to support both production
/// (`std::time::Instant`) and simulation (`tokio::time::Instant`).
#[derive(Debug, Clone)]
pub enum SessionEvent<I = std::time::Instant> {
    /// Begin connecting.
    Start,

    /// Result of a `ValidateSession` action.
    Validated(Result<(), String>),

    /// A `Subscribe` action succeeded.
    Subscribed {
        /// Attempt number from the action
        attempt: u32,
    },

    /// A `Subscribe` or `TrackPresence` action failed.
    SubscribeFailed {
        /// Attempt number from the action
        attempt: u32,
        /// Channel error text
        reason: String,
    },

    /// A `TrackPresence` action succeeded.
    PresenceTracked {
        /// Attempt number from the action
        attempt: u32,
    },

    /// The channel reported a new presence roster.
    Presence(Vec<SessionIdentity>),

    /// The channel delivered an encoded envelope.
    EnvelopeReceived(Vec<u8>),

    /// Time tick for deadline processing.
    ///
    /// The caller should tick at [`next_deadline`] or sooner.
    ///
    /// [`next_deadline`]: crate::SessionController::next_deadline
    Tick {
        /// Current time from the environment.
        now: I,
    },
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The local user ended it
    Local,
    /// The peer left the roster and the grace delay elapsed
    PeerDeparted,
    /// The peer broadcast `session-terminated`
    PeerTerminated,
}

/// Coarse session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Transport not yet connected
    Connecting,
    /// Connected, waiting for the peer's public key
    KeyExchange,
    /// Session key derived, fingerprints not yet confirmed
    AwaitingVerification,
    /// Fingerprints confirmed
    Ready,
    /// Termination sequence in progress
    Terminating,
    /// Local state zeroized
    Terminated,
}

/// Something the application should show or react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// Connection status or progress changed
    StateChanged(ConnectionState),
    /// Both fingerprints are known; ask the user to compare them
    FingerprintsReady {
        /// Our fingerprint
        local: Fingerprint,
        /// Peer fingerprint
        peer: Fingerprint,
    },
    /// The user confirmed the fingerprints
    Verified,
    /// A message was added to the queue
    MessageReceived {
        /// Queue id
        id: String,
        /// Payload kind
        kind: MessageKind,
    },
    /// The peer acknowledged one of our messages
    MessageAcknowledged {
        /// Queue id
        id: String,
    },
    /// The peer joined the channel
    PeerPresent,
    /// The peer left; termination follows after the grace delay
    PeerDeparted,
    /// A second, different public key arrived and was rejected
    KeySubstitution {
        /// Fingerprint of the rejected key
        fingerprint: Fingerprint,
    },
    /// The channel went stale and is being re-subscribed
    Reconnecting,
    /// The transport gave up
    TransportFailed(TransportError),
    /// Local state has been zeroized
    Terminated {
        /// What ended the session
        reason: TerminationReason,
    },
}

/// Actions the controller produces for the caller to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Broadcast an envelope on the channel.
    Broadcast(Envelope),

    /// Ask the registry whether the session is live. Report the result as
    /// [`SessionEvent::Validated`].
    ValidateSession {
        /// Session to check
        session_id: SessionId,
    },

    /// Subscribe to `channel`. Report the result as
    /// [`SessionEvent::Subscribed`] or [`SessionEvent::SubscribeFailed`].
    Subscribe {
        /// Channel name
        channel: String,
        /// Attempt number to echo back
        attempt: u32,
    },

    /// Register `identity` in the presence roster. Report the result as
    /// [`SessionEvent::PresenceTracked`] or [`SessionEvent::SubscribeFailed`].
    TrackPresence {
        /// Our presence identity
        identity: SessionIdentity,
        /// Attempt number to echo back
        attempt: u32,
    },

    /// Leave the channel.
    Unsubscribe,

    /// Remove the session from the registry.
    DeleteSession {
        /// Session to delete
        session_id: SessionId,
    },

    /// Push back the session's registry expiry.
    ExtendSession {
        /// Session to extend
        session_id: SessionId,
    },

    /// Set a local marker for this session.
    SetMarker(Marker),

    /// Clear every local marker of this session.
    ClearMarkers,

    /// Call [`zeroize_local`] and execute what it returns. Always the last
    /// step of the termination sequence.
    ///
    /// [`zeroize_local`]: crate::SessionController::zeroize_local
    ZeroizeLocal,

    /// Surface a notice to the application.
    Notify(SessionNotice),
}

/// Result of a send: the queue id of the new message and the actions that
/// deliver it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// Message id (hex nonce), also the key for acknowledgments
    pub message_id: String,
    /// Actions to execute
    pub actions: Vec<SessionAction>,
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session id
    pub session_id: SessionId,
    /// Lifecycle phase
    pub phase: SessionPhase,
    /// Transport state
    pub connection: ConnectionState,
    /// Our fingerprint
    pub local_fingerprint: Fingerprint,
    /// Peer fingerprint, once the key exchange completed
    pub peer_fingerprint: Option<Fingerprint>,
    /// Whether the user confirmed the fingerprints
    pub verified: bool,
    /// Whether the peer is in the roster
    pub peer_present: bool,
    /// Queue accounting for this session
    pub memory: MemoryStats,
}

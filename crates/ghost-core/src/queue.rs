#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

//! RAM-only message store.
//!
//! Messages live in a per-session list, in insertion order, behind one mutex.
//! Nothing is ever written anywhere else. Readers get snapshot copies, never
//! references into the store. Purging zeroizes message contents as they are
//! dropped.
//!
//! A poisoned lock is recovered rather than propagated: purge and session
//! destruction must always be able to run.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::identity::SessionId;

/// What a queued message holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text
    Text,
    /// File attachment
    File,
    /// Voice recording (content is the sealed voice payload)
    Voice,
    /// Locally generated notice
    System,
}

/// Who authored a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    /// This participant
    Local,
    /// The other participant
    Peer,
}

/// One message in the queue.
///
/// Content and file name are zeroized when the message is dropped, including
/// every snapshot copy.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct QueuedMessage {
    /// Unique id (hex nonce)
    pub id: String,
    /// Plaintext bytes
    pub content: Vec<u8>,
    /// Author
    #[zeroize(skip)]
    pub sender: Sender,
    /// Unix milliseconds
    pub timestamp: u64,
    /// Payload kind
    #[zeroize(skip)]
    pub kind: MessageKind,
    /// Attachment name, for files
    pub file_name: Option<String>,
    /// Whether the peer confirmed receipt
    pub acknowledged: bool,
}

impl QueuedMessage {
    /// New unacknowledged message.
    pub fn new(
        id: impl Into<String>,
        content: Vec<u8>,
        sender: Sender,
        kind: MessageKind,
        timestamp: u64,
    ) -> Self {
        Self {
            id: id.into(),
            content,
            sender,
            timestamp,
            kind,
            file_name: None,
            acknowledged: false,
        }
    }

    /// Attach a file name.
    #[must_use]
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// Bytes counted against memory usage: content plus id.
    pub fn estimated_bytes(&self) -> usize {
        self.content.len() + self.id.len()
    }
}

impl fmt::Debug for QueuedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedMessage")
            .field("id", &self.id)
            .field("len", &self.content.len())
            .field("sender", &self.sender)
            .field("kind", &self.kind)
            .field("timestamp", &self.timestamp)
            .field("acknowledged", &self.acknowledged)
            .finish()
    }
}

/// Memory accounting for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Number of messages held
    pub count: usize,
    /// Sum of content and id lengths
    pub estimated_bytes: usize,
}

/// Shared handle to the in-memory queue.
///
/// Cloning yields another handle to the same store.
#[derive(Clone, Default)]
pub struct MessageQueue {
    inner: Arc<Mutex<QueueInner>>,
}

#[derive(Default)]
struct QueueInner {
    sessions: HashMap<SessionId, SessionMessages>,
}

#[derive(Default)]
struct SessionMessages {
    messages: Vec<QueuedMessage>,
    estimated_bytes: usize,
}

impl MessageQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `message` to `session_id`. Returns false if the id was already
    /// present, in which case the queue is unchanged.
    pub fn add_message(&self, session_id: &SessionId, message: QueuedMessage) -> bool {
        let mut inner = self.lock();
        let session = inner.sessions.entry(session_id.clone()).or_default();

        if session.messages.iter().any(|m| m.id == message.id) {
            tracing::debug!(%session_id, id = %message.id, "duplicate message ignored");
            return false;
        }

        session.estimated_bytes += message.estimated_bytes();
        session.messages.push(message);
        true
    }

    /// Snapshot of every message in `session_id`, oldest first.
    pub fn get_messages(&self, session_id: &SessionId) -> Vec<QueuedMessage> {
        self.lock().sessions.get(session_id).map(|s| s.messages.clone()).unwrap_or_default()
    }

    /// Snapshot of one message.
    pub fn get_message(&self, session_id: &SessionId, message_id: &str) -> Option<QueuedMessage> {
        self.lock()
            .sessions
            .get(session_id)
            .and_then(|s| s.messages.iter().find(|m| m.id == message_id).cloned())
    }

    /// Count and estimated size for `session_id`. Unknown sessions are empty.
    pub fn memory_stats(&self, session_id: &SessionId) -> MemoryStats {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| MemoryStats { count: s.messages.len(), estimated_bytes: s.estimated_bytes })
            .unwrap_or_default()
    }

    /// Mark `message_id` acknowledged. Returns true if the message exists.
    ///
    /// Idempotent. Unknown ids are ignored.
    pub fn acknowledge_message(&self, session_id: &SessionId, message_id: &str) -> bool {
        let mut inner = self.lock();
        let Some(message) = inner
            .sessions
            .get_mut(session_id)
            .and_then(|s| s.messages.iter_mut().find(|m| m.id == message_id))
        else {
            return false;
        };

        message.acknowledged = true;
        true
    }

    /// Remove one session and its accounting entry.
    pub fn destroy_session(&self, session_id: &SessionId) {
        let removed = self.lock().sessions.remove(session_id);
        if let Some(session) = removed {
            tracing::debug!(%session_id, count = session.messages.len(), "session messages destroyed");
        }
    }

    /// Remove every message of every session.
    pub fn nuclear_purge(&self) {
        let mut inner = self.lock();
        let sessions = inner.sessions.len();
        inner.sessions.clear();
        tracing::info!(sessions, "message queue purged");
    }

    /// Number of sessions holding at least one entry.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue").field("sessions", &self.session_count()).finish()
    }
}

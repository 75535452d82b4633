#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

//! Short-lived local flags.
//!
//! Markers remember UI facts for the life of a session, such as "the user was
//! already shown the verification prompt". They never hold keys or plaintext
//! and are cleared during zeroization.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ghost_core::SessionId;

/// A per-session flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    /// The fingerprint comparison prompt was shown
    VerificationPrompted,
}

/// Storage for per-session markers.
///
/// Synchronous, like the storage traits in the server crates: marker writes
/// are small and local.
pub trait LocalMarkers: Send + Sync {
    /// Set `marker` for `session_id`.
    fn set(&self, session_id: &SessionId, marker: Marker);

    /// Whether `marker` is set for `session_id`.
    fn is_set(&self, session_id: &SessionId, marker: Marker) -> bool;

    /// Remove every marker of `session_id`.
    fn clear(&self, session_id: &SessionId);
}

/// In-process marker store.
#[derive(Debug, Clone, Default)]
pub struct MemoryMarkers {
    inner: Arc<Mutex<HashMap<SessionId, HashSet<Marker>>>>,
}

impl MemoryMarkers {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, HashSet<Marker>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of sessions with at least one marker.
    pub fn session_count(&self) -> usize {
        self.lock().len()
    }
}

impl LocalMarkers for MemoryMarkers {
    fn set(&self, session_id: &SessionId, marker: Marker) {
        self.lock().entry(session_id.clone()).or_default().insert(marker);
    }

    fn is_set(&self, session_id: &SessionId, marker: Marker) -> bool {
        self.lock().get(session_id).is_some_and(|markers| markers.contains(&marker))
    }

    fn clear(&self, session_id: &SessionId) {
        self.lock().remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_are_per_session() {
        let markers = MemoryMarkers::new();
        let a = SessionId::parse("GHOST-AAAA-AAAA").unwrap();
        let b = SessionId::parse("GHOST-BBBB-BBBB").unwrap();

        markers.set(&a, Marker::VerificationPrompted);

        assert!(markers.is_set(&a, Marker::VerificationPrompted));
        assert!(!markers.is_set(&b, Marker::VerificationPrompted));
    }

    #[test]
    fn clear_removes_session_entry() {
        let markers = MemoryMarkers::new();
        let a = SessionId::parse("GHOST-AAAA-AAAA").unwrap();
        markers.set(&a, Marker::VerificationPrompted);

        markers.clear(&a);
        markers.clear(&a);

        assert!(!markers.is_set(&a, Marker::VerificationPrompted));
        assert_eq!(markers.session_count(), 0);
    }
}

//! In-memory session registry.
//!
//! Records live session ids, counts every call and can be told to fail so
//! tests can check that registry trouble never blocks local zeroization.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ghost_client::{RegistryError, SessionRegistry};
use ghost_core::SessionId;
use ghost_crypto::Fingerprint;

/// Number of calls of each kind a [`MemoryRegistry`] has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCalls {
    /// `reserve` calls
    pub reserve: u32,
    /// `validate` calls
    pub validate: u32,
    /// `extend` calls
    pub extend: u32,
    /// `delete_session` calls
    pub delete: u32,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Option<Fingerprint>>,
    calls: RegistryCalls,
    failure: Option<RegistryError>,
}

/// Shared in-memory registry. Cheap to clone; clones see the same sessions.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl MemoryRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `session_id` live without going through `reserve`.
    pub fn insert(&self, session_id: SessionId) {
        self.lock().sessions.insert(session_id, None);
    }

    /// Whether `session_id` is live.
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.lock().sessions.contains_key(session_id)
    }

    /// Fingerprint recorded when `session_id` was reserved.
    pub fn owner(&self, session_id: &SessionId) -> Option<Fingerprint> {
        self.lock().sessions.get(session_id).copied().flatten()
    }

    /// Call counts so far.
    pub fn calls(&self) -> RegistryCalls {
        self.lock().calls
    }

    /// Fail every following call with `err` until [`Self::recover`].
    pub fn fail_with(&self, err: RegistryError) {
        self.lock().failure = Some(err);
    }

    /// Stop failing calls.
    pub fn recover(&self) {
        self.lock().failure = None;
    }

    fn check(state: &RegistryState) -> Result<(), RegistryError> {
        state.failure.clone().map_or(Ok(()), Err)
    }
}

impl SessionRegistry for MemoryRegistry {
    async fn reserve(
        &self,
        session_id: &SessionId,
        fingerprint: &Fingerprint,
    ) -> Result<(), RegistryError> {
        let mut state = self.lock();
        state.calls.reserve += 1;
        Self::check(&state)?;

        if state.sessions.contains_key(session_id) {
            return Err(RegistryError::Rejected(format!("{session_id} is already reserved")));
        }
        state.sessions.insert(session_id.clone(), Some(*fingerprint));
        Ok(())
    }

    async fn validate(&self, session_id: &SessionId) -> Result<bool, RegistryError> {
        let mut state = self.lock();
        state.calls.validate += 1;
        Self::check(&state)?;
        Ok(state.sessions.contains_key(session_id))
    }

    async fn extend(&self, session_id: &SessionId) -> Result<(), RegistryError> {
        let mut state = self.lock();
        state.calls.extend += 1;
        Self::check(&state)?;

        if state.sessions.contains_key(session_id) {
            Ok(())
        } else {
            Err(RegistryError::Rejected(format!("{session_id} is not live")))
        }
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), RegistryError> {
        let mut state = self.lock();
        state.calls.delete += 1;
        Self::check(&state)?;
        state.sessions.remove(session_id);
        Ok(())
    }
}

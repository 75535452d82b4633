//! Backend session registry abstraction.
//!
//! The registry only records that a session id exists and for how long. It
//! never sees keys or content.

use std::future::Future;

use ghost_core::SessionId;
use ghost_crypto::Fingerprint;

use crate::error::RegistryError;

/// Remote record of live session ids.
///
/// Every call is made once. Failures are reported to the caller with a
/// [`RegistryError`] code and never retried.
pub trait SessionRegistry: Send + Sync {
    /// Reserve `session_id` for a new session created by the holder of
    /// `fingerprint`.
    fn reserve(
        &self,
        session_id: &SessionId,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;

    /// Whether `session_id` is live.
    fn validate(
        &self,
        session_id: &SessionId,
    ) -> impl Future<Output = Result<bool, RegistryError>> + Send;

    /// Push back the expiry of `session_id`.
    fn extend(
        &self,
        session_id: &SessionId,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;

    /// Remove `session_id`.
    fn delete_session(
        &self,
        session_id: &SessionId,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;
}

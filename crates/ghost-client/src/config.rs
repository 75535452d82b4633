//! Session configuration.

use std::time::Duration;

use ghost_core::{TransportConfig, voice::DEFAULT_MAX_PLAYED_IDS};

/// Ignore termination requests arriving sooner than this after the last one.
pub const DEFAULT_TERMINATION_DEBOUNCE: Duration = Duration::from_secs(2);

/// Delay between losing the peer (or its goodbye) and terminating.
pub const DEFAULT_DEPARTURE_GRACE: Duration = Duration::from_millis(1500);

/// Interval between registry keepalives while connected.
pub const DEFAULT_REGISTRY_KEEPALIVE: Duration = Duration::from_secs(5 * 60);

/// How strictly fingerprint verification gates sending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerificationPolicy {
    /// Sending fails with `UnverifiedChannel` until the user confirms
    #[default]
    Required,
    /// The prompt is shown but sending is allowed before confirmation
    Advisory,
}

/// Session tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Connection lifecycle tuning
    pub transport: TransportConfig,
    /// Debounce window for termination requests
    pub termination_debounce: Duration,
    /// Grace delay before terminating after the peer leaves
    pub departure_grace: Duration,
    /// Fingerprint gate
    pub verification: VerificationPolicy,
    /// Registry keepalive interval
    pub registry_keepalive: Duration,
    /// Bound on one-time voice ids remembered per session
    pub max_played_ids: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            termination_debounce: DEFAULT_TERMINATION_DEBOUNCE,
            departure_grace: DEFAULT_DEPARTURE_GRACE,
            verification: VerificationPolicy::default(),
            registry_keepalive: DEFAULT_REGISTRY_KEEPALIVE,
            max_played_ids: DEFAULT_MAX_PLAYED_IDS,
        }
    }
}

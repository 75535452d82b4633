//! Clock and randomness for session state machines.
//!
//! Every deadline in a session (subscribe timeouts, backoff, heartbeats,
//! termination debounce, departure grace) is measured against
//! [`Environment::now`], and every nonce, salt, key scalar and session id is
//! drawn from [`Environment::random_bytes`]. Tests swap in a paused tokio
//! clock and a seeded RNG so a whole session replays identically.

use std::{ops::Add, time::Duration};

/// Time and entropy source for one session.
///
/// Implementations must keep `now()` monotonic and must back
/// `random_bytes()` with a CSPRNG outside of tests: nonce uniqueness and
/// ephemeral key secrecy rest on it.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant that session deadlines are expressed in.
    type Instant: Copy
        + Ord
        + Send
        + Sync
        + std::fmt::Debug
        + std::ops::Sub<Output = Duration>
        + Add<Duration, Output = Self::Instant>;

    /// Current monotonic time. Never decreases.
    fn now(&self) -> Self::Instant;

    /// Wait for `duration`. Only the runtime sleeps; state machines take
    /// `now` instead.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes. Seeded environments repeat the same
    /// stream for the same seed.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Wall-clock time in milliseconds since the Unix epoch.
    ///
    /// Used only for message timestamps and voice capture timestamps, never
    /// for timeouts.
    fn wall_clock_millis(&self) -> u64;

    /// Random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Random fixed-size array, e.g. a nonce or salt.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }
}

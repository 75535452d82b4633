//! Simulation environment.
//!
//! Time comes from tokio's clock, so tests running with a paused clock
//! (`#[tokio::test(start_paused = true)]`) advance through timeouts and grace
//! delays instantly. Randomness comes from a seeded ChaCha20 stream shared by
//! every clone.

#![allow(clippy::disallowed_types, reason = "Synchronous RNG access only")]

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use ghost_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Wall clock reported at simulation start (2023-11-14T22:13:20Z).
const SIM_EPOCH_MILLIS: u64 = 1_700_000_000_000;

/// Deterministic environment for simulation.
///
/// Clones share one RNG stream. Two environments built from the same seed
/// produce the same bytes in the same order.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
    started: tokio::time::Instant,
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            started: tokio::time::Instant::now(),
        }
    }

    /// Virtual time elapsed since this environment was created.
    pub fn elapsed(&self) -> Duration {
        tokio::time::Instant::now() - self.started
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }

    fn wall_clock_millis(&self) -> u64 {
        let elapsed = u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX);
        SIM_EPOCH_MILLIS.saturating_add(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_bytes() {
        let a = SimEnv::with_seed(42);
        let b = SimEnv::with_seed(42);

        assert_eq!(a.random_array::<32>(), b.random_array::<32>());
    }

    #[test]
    fn clones_share_the_stream() {
        let a = SimEnv::with_seed(42);
        let b = a.clone();
        let fresh = SimEnv::with_seed(42);

        let first = a.random_u64();
        let second = b.random_u64();

        assert_ne!(first, second);
        assert_eq!(first, fresh.random_u64());
        assert_eq!(second, fresh.random_u64());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_advances_virtual_time() {
        let env = SimEnv::new();
        let before = env.now();

        env.sleep(Duration::from_secs(30)).await;

        assert_eq!(env.now() - before, Duration::from_secs(30));
        assert_eq!(env.wall_clock_millis(), SIM_EPOCH_MILLIS + 30_000);
    }
}

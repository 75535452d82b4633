//! Hand-driven environment for controller tests.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ghost_core::Environment;

/// Environment whose clock only moves when [`ManualEnv::advance`] is called.
///
/// The instant is a `Duration` since an arbitrary epoch. Randomness is a
/// splitmix64 stream per seed; environments created with
/// [`ManualEnv::with_seed`] share the clock but not the stream.
#[derive(Clone)]
pub(crate) struct ManualEnv {
    clock_nanos: Arc<AtomicU64>,
    rng: Arc<AtomicU64>,
}

impl ManualEnv {
    pub(crate) fn new(seed: u64) -> Self {
        Self { clock_nanos: Arc::new(AtomicU64::new(0)), rng: Arc::new(AtomicU64::new(seed)) }
    }

    /// Another environment on the same clock with its own random stream.
    pub(crate) fn with_seed(&self, seed: u64) -> Self {
        Self { clock_nanos: Arc::clone(&self.clock_nanos), rng: Arc::new(AtomicU64::new(seed)) }
    }

    pub(crate) fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.clock_nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    fn next_u64(&self) -> u64 {
        let mut z = self.rng.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

impl Environment for ManualEnv {
    type Instant = Duration;

    fn now(&self) -> Duration {
        Duration::from_nanos(self.clock_nanos.load(Ordering::SeqCst))
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        for chunk in buffer.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn wall_clock_millis(&self) -> u64 {
        let elapsed = u64::try_from(self.now().as_millis()).unwrap_or(u64::MAX);
        1_700_000_000_000 + elapsed
    }
}

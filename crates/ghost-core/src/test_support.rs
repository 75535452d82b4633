//! Deterministic environment for unit tests.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::env::Environment;

/// Environment whose instant is a `Duration` since an arbitrary epoch.
///
/// Random bytes come from `script` first, then from a splitmix64 stream.
#[derive(Clone)]
pub(crate) struct TestEnv {
    script: Arc<[u8]>,
    position: Arc<AtomicUsize>,
    state: Arc<AtomicU64>,
    wall_clock: u64,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        Self::with_script(Vec::new())
    }

    pub(crate) fn with_script(script: Vec<u8>) -> Self {
        Self {
            script: script.into(),
            position: Arc::new(AtomicUsize::new(0)),
            state: Arc::new(AtomicU64::new(0x5EED)),
            wall_clock: 1_700_000_000_000,
        }
    }

    fn next_byte(&self) -> u8 {
        let position = self.position.fetch_add(1, Ordering::Relaxed);
        if let Some(byte) = self.script.get(position) {
            return *byte;
        }

        let mut z = self.state.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        (z ^ (z >> 31)) as u8
    }
}

impl Environment for TestEnv {
    type Instant = Duration;

    fn now(&self) -> Duration {
        Duration::ZERO
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        for byte in buffer.iter_mut() {
            *byte = self.next_byte();
        }
    }

    fn wall_clock_millis(&self) -> u64 {
        self.wall_clock
    }
}

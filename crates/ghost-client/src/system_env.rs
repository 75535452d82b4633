//! Real clock and OS entropy for live sessions.

use std::time::Duration;

use ghost_core::Environment;

/// Environment for a live session: `std::time::Instant` for deadlines, tokio
/// for sleeping, the OS RNG (getrandom) for ephemeral keys, nonces and
/// session ids.
///
/// # Panics
///
/// `random_bytes` panics if the OS RNG fails. A session cannot be keyed
/// without it.
#[derive(Debug, Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Live environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG available, session keys and nonces depend on it");
    }

    /// Clocks set before 1970 report 0; the value only stamps messages.
    #[allow(clippy::disallowed_methods)]
    fn wall_clock_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn system_env_time_advances() {
        let env = SystemEnv::new();

        let t1 = env.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = env.now();

        assert!(t2 > t1, "Time should advance");
    }

    #[test]
    fn system_env_random_bytes_are_random() {
        let env = SystemEnv::new();

        let first: [u8; 32] = env.random_array();
        let second: [u8; 32] = env.random_array();

        assert_ne!(first, second, "Random bytes should differ");
    }

    #[test]
    fn wall_clock_is_in_milliseconds() {
        let env = SystemEnv::new();

        // 2020-01-01 in unix milliseconds
        assert!(env.wall_clock_millis() > 1_577_836_800_000);
    }

    #[tokio::test]
    async fn system_env_sleep_works() {
        let env = SystemEnv::new();

        let start = env.now();
        env.sleep(Duration::from_millis(50)).await;
        let elapsed = env.now() - start;

        assert!(elapsed >= Duration::from_millis(50), "Sleep should wait at least 50ms");
    }
}

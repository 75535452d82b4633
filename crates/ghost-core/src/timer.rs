//! Deadline table for Sans-IO state machines.
//!
//! State machines never spawn timer tasks. They record deadlines here and the
//! driver asks for [`Timers::next_deadline`], sleeps until then, and feeds the
//! time back in. Expired keys are drained by [`Timers::expire`]. Cancelling a
//! deadline is just removing the entry, so a closed machine leaves nothing
//! running behind it.

use std::{collections::HashMap, hash::Hash, ops::Add, time::Duration};

/// Named deadlines keyed by `K`, measured in instants of type `I`.
///
/// At most one deadline exists per key. Scheduling an existing key replaces
/// its deadline.
#[derive(Debug, Clone)]
pub struct Timers<K, I> {
    deadlines: HashMap<K, I>,
}

impl<K, I> Default for Timers<K, I> {
    fn default() -> Self {
        Self { deadlines: HashMap::new() }
    }
}

impl<K, I> Timers<K, I>
where
    K: Copy + Eq + Hash + Ord,
    I: Copy + Ord + Add<Duration, Output = I>,
{
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key` to fire `after` from `now`, replacing any previous deadline.
    pub fn schedule(&mut self, key: K, now: I, after: Duration) {
        self.deadlines.insert(key, now + after);
    }

    /// Disarm `key`. Returns true if it was armed.
    pub fn cancel(&mut self, key: K) -> bool {
        self.deadlines.remove(&key).is_some()
    }

    /// Disarm everything.
    pub fn cancel_all(&mut self) {
        self.deadlines.clear();
    }

    /// Whether `key` is armed.
    pub fn is_scheduled(&self, key: K) -> bool {
        self.deadlines.contains_key(&key)
    }

    /// Deadline of `key`, if armed.
    pub fn deadline(&self, key: K) -> Option<I> {
        self.deadlines.get(&key).copied()
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<I> {
        self.deadlines.values().min().copied()
    }

    /// Number of armed deadlines.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// True if nothing is armed.
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Remove and return every key whose deadline is at or before `now`.
    ///
    /// Keys come back ordered by deadline, ties broken by key order, so the
    /// caller processes them deterministically.
    pub fn expire(&mut self, now: I) -> Vec<K> {
        let mut due: Vec<(I, K)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, deadline)| (*deadline, *key))
            .collect();
        due.sort();

        for (_, key) in &due {
            self.deadlines.remove(key);
        }

        due.into_iter().map(|(_, key)| key).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A plain `Duration` since an arbitrary epoch serves as a virtual instant.
    const T0: Duration = Duration::ZERO;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    enum Key {
        A,
        B,
        C,
    }

    #[test]
    fn expire_returns_due_keys_in_deadline_order() {
        let t0 = T0;
        let mut timers = Timers::new();
        timers.schedule(Key::A, t0, Duration::from_secs(3));
        timers.schedule(Key::B, t0, Duration::from_secs(1));
        timers.schedule(Key::C, t0, Duration::from_secs(10));

        let due = timers.expire(t0 + Duration::from_secs(3));

        assert_eq!(due, vec![Key::B, Key::A]);
        assert_eq!(timers.len(), 1);
        assert!(timers.is_scheduled(Key::C));
    }

    #[test]
    fn nothing_expires_early() {
        let t0 = T0;
        let mut timers = Timers::new();
        timers.schedule(Key::A, t0, Duration::from_millis(1500));

        assert!(timers.expire(t0 + Duration::from_millis(1499)).is_empty());
        assert_eq!(timers.expire(t0 + Duration::from_millis(1500)), vec![Key::A]);
    }

    #[test]
    fn reschedule_replaces_deadline() {
        let t0 = T0;
        let mut timers = Timers::new();
        timers.schedule(Key::A, t0, Duration::from_secs(1));
        timers.schedule(Key::A, t0, Duration::from_secs(5));

        assert_eq!(timers.len(), 1);
        assert_eq!(timers.deadline(Key::A), Some(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn cancel_all_leaves_no_deadline() {
        let t0 = T0;
        let mut timers = Timers::new();
        timers.schedule(Key::A, t0, Duration::from_secs(1));
        timers.schedule(Key::B, t0, Duration::from_secs(2));

        assert!(timers.cancel(Key::A));
        assert!(!timers.cancel(Key::A));

        timers.cancel_all();

        assert!(timers.is_empty());
        assert_eq!(timers.next_deadline(), None);
        assert!(timers.expire(t0 + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn next_deadline_is_minimum() {
        let t0 = T0;
        let mut timers = Timers::new();
        timers.schedule(Key::C, t0, Duration::from_secs(10));
        timers.schedule(Key::B, t0, Duration::from_secs(2));

        assert_eq!(timers.next_deadline(), Some(t0 + Duration::from_secs(2)));
    }
}

//! In-memory session relay.
//!
//! [`SimRelay`] stands in for the hosted realtime service: named broadcast
//! channels with a presence roster per channel. Each participant connects a
//! [`SimChannel`], which implements [`Channel`] so the production
//! [`ghost_client::Runtime`] runs unchanged against it.
//!
//! # Delivery model
//!
//! - Broadcasts reach every other member subscribed to the same channel, in
//!   send order
//! - Tracking or leaving publishes the full roster to every member of the
//!   channel, including the one that changed
//! - Subscribed members receive the roster again every
//!   [`RelayConfig::presence_sync`], which keeps idle sessions from looking
//!   stale
//! - Dropping a [`SimChannel`] removes its member as if the connection had
//!   vanished
//!
//! # Fault injection
//!
//! Subscribe attempts can be rejected or left hanging, either for the next
//! `n` attempts or for all of them.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use ghost_client::{Channel, ChannelError, ChannelEvent};
use ghost_core::SessionIdentity;
use tokio::sync::mpsc;

/// Identifier of one connected member.
pub type MemberId = u64;

/// Default interval between roster re-publications.
pub const DEFAULT_PRESENCE_SYNC: Duration = Duration::from_secs(15);

/// How a faulty subscribe attempt misbehaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeFault {
    /// The relay answers with an error
    Reject(String),
    /// The relay never answers
    Hang,
}

/// Relay tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Interval at which subscribed members receive the roster again.
    /// `None` disables periodic syncs.
    pub presence_sync: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { presence_sync: Some(DEFAULT_PRESENCE_SYNC) }
    }
}

struct Member {
    channel: Option<String>,
    identity: Option<SessionIdentity>,
    inbox: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Default)]
struct RelayState {
    members: BTreeMap<MemberId, Member>,
    next_member: MemberId,
    queued_faults: VecDeque<SubscribeFault>,
    standing_fault: Option<SubscribeFault>,
    subscribe_attempts: u64,
    broadcasts: u64,
}

impl RelayState {
    fn roster(&self, channel: &str) -> Vec<SessionIdentity> {
        self.members
            .values()
            .filter(|m| m.channel.as_deref() == Some(channel))
            .filter_map(|m| m.identity.clone())
            .collect()
    }

    fn publish_roster(&self, channel: &str) {
        let roster = self.roster(channel);
        for member in self.members.values().filter(|m| m.channel.as_deref() == Some(channel)) {
            // Closed inboxes belong to members whose channel is being dropped
            let _ = member.inbox.send(ChannelEvent::Presence(roster.clone()));
        }
    }

    /// Clear the member's subscription. Returns the channel whose roster
    /// changed, if any.
    fn leave(&mut self, id: MemberId) -> Option<String> {
        let member = self.members.get_mut(&id)?;
        let channel = member.channel.take()?;
        member.identity.take().map(|_| channel)
    }
}

/// Shared in-memory relay. Cheap to clone.
#[derive(Clone, Default)]
pub struct SimRelay {
    state: Arc<Mutex<RelayState>>,
    config: RelayConfig,
}

impl SimRelay {
    /// Relay with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay with custom configuration.
    pub fn with_config(config: RelayConfig) -> Self {
        Self { state: Arc::default(), config }
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new connection to the relay.
    pub fn connect(&self) -> SimChannel {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let id = state.next_member;
        state.next_member += 1;
        state.members.insert(id, Member { channel: None, identity: None, inbox: tx });
        drop(state);

        tracing::debug!(member = id, "relay connection opened");
        SimChannel { id, relay: self.clone(), inbox: rx, next_sync: None }
    }

    /// Make the next `count` subscribe attempts misbehave.
    pub fn fail_next_subscribes(&self, fault: SubscribeFault, count: usize) {
        self.lock().queued_faults.extend(std::iter::repeat_n(fault, count));
    }

    /// Make every subscribe attempt misbehave until [`Self::clear_faults`].
    pub fn fail_all_subscribes(&self, fault: SubscribeFault) {
        self.lock().standing_fault = Some(fault);
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.queued_faults.clear();
        state.standing_fault = None;
    }

    /// Sever `member` as if its connection dropped. Its channel receives
    /// `None` from then on and the remaining members see the new roster.
    pub fn disconnect(&self, member: MemberId) {
        let mut state = self.lock();
        let changed = state.leave(member);
        state.members.remove(&member);
        if let Some(channel) = changed {
            state.publish_roster(&channel);
        }
        tracing::debug!(member, "relay connection closed");
    }

    /// Identities currently tracked on `channel`.
    pub fn roster(&self, channel: &str) -> Vec<SessionIdentity> {
        self.lock().roster(channel)
    }

    /// Members currently subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().members.values().filter(|m| m.channel.as_deref() == Some(channel)).count()
    }

    /// Subscribe calls received since the relay was created, faulty ones
    /// included.
    pub fn subscribe_attempts(&self) -> u64 {
        self.lock().subscribe_attempts
    }

    /// Broadcasts accepted since the relay was created.
    pub fn broadcast_count(&self) -> u64 {
        self.lock().broadcasts
    }

    fn take_fault(&self) -> Option<SubscribeFault> {
        let mut state = self.lock();
        state.subscribe_attempts += 1;
        state.queued_faults.pop_front().or_else(|| state.standing_fault.clone())
    }

    fn join(&self, id: MemberId, name: &str) -> Result<(), ChannelError> {
        let mut state = self.lock();
        let changed = state.leave(id);
        let member = state.members.get_mut(&id).ok_or(ChannelError::Closed)?;
        member.channel = Some(name.to_string());
        if let Some(previous) = changed {
            state.publish_roster(&previous);
        }
        Ok(())
    }

    fn track(&self, id: MemberId, identity: &SessionIdentity) -> Result<(), ChannelError> {
        let mut state = self.lock();
        let member = state.members.get_mut(&id).ok_or(ChannelError::Closed)?;
        let channel = member
            .channel
            .clone()
            .ok_or_else(|| ChannelError::Failed("track before subscribe".to_string()))?;
        member.identity = Some(identity.clone());
        state.publish_roster(&channel);
        Ok(())
    }

    fn publish(&self, id: MemberId, payload: Vec<u8>) -> Result<(), ChannelError> {
        let mut state = self.lock();
        let member = state.members.get(&id).ok_or(ChannelError::Closed)?;
        let channel = member
            .channel
            .clone()
            .ok_or_else(|| ChannelError::Failed("broadcast before subscribe".to_string()))?;

        for (_, other) in state
            .members
            .iter()
            .filter(|(other, m)| **other != id && m.channel.as_deref() == Some(channel.as_str()))
        {
            let _ = other.inbox.send(ChannelEvent::Message(payload.clone()));
        }
        state.broadcasts += 1;
        Ok(())
    }

    fn leave(&self, id: MemberId) {
        let mut state = self.lock();
        if let Some(channel) = state.leave(id) {
            state.publish_roster(&channel);
        }
    }

    fn current_roster(&self, id: MemberId) -> Option<Vec<SessionIdentity>> {
        let state = self.lock();
        let channel = state.members.get(&id)?.channel.as_deref()?;
        Some(state.roster(channel))
    }
}

/// One member's connection to a [`SimRelay`].
pub struct SimChannel {
    id: MemberId,
    relay: SimRelay,
    inbox: mpsc::UnboundedReceiver<ChannelEvent>,
    next_sync: Option<tokio::time::Instant>,
}

impl SimChannel {
    /// Member id of this connection.
    pub fn member_id(&self) -> MemberId {
        self.id
    }
}

impl Channel for SimChannel {
    async fn subscribe(&mut self, name: &str) -> Result<(), ChannelError> {
        match self.relay.take_fault() {
            Some(SubscribeFault::Hang) => {
                tracing::debug!(member = self.id, "subscribe hangs");
                std::future::pending::<Result<(), ChannelError>>().await
            },
            Some(SubscribeFault::Reject(reason)) => Err(ChannelError::Failed(reason)),
            None => {
                self.relay.join(self.id, name)?;
                self.next_sync =
                    self.relay.config.presence_sync.map(|every| tokio::time::Instant::now() + every);
                Ok(())
            },
        }
    }

    async fn track(&mut self, identity: &SessionIdentity) -> Result<(), ChannelError> {
        self.relay.track(self.id, identity)
    }

    async fn broadcast(&mut self, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.relay.publish(self.id, payload)
    }

    async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            let Some(at) = self.next_sync else {
                return self.inbox.recv().await;
            };

            tokio::select! {
                event = self.inbox.recv() => return event,
                () = tokio::time::sleep_until(at) => {
                    self.next_sync = self.relay.config.presence_sync.map(|every| at + every);
                    if let Some(roster) = self.relay.current_roster(self.id) {
                        return Some(ChannelEvent::Presence(roster));
                    }
                },
            }
        }
    }

    async fn unsubscribe(&mut self) {
        self.next_sync = None;
        self.relay.leave(self.id);
    }
}

impl Drop for SimChannel {
    fn drop(&mut self) {
        self.relay.disconnect(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> SessionIdentity {
        SessionIdentity::from_raw(name)
    }

    #[tokio::test]
    async fn broadcast_skips_sender_and_other_channels() {
        let relay = SimRelay::with_config(RelayConfig { presence_sync: None });
        let mut alice = relay.connect();
        let mut bob = relay.connect();
        let mut eve = relay.connect();
        alice.subscribe("session:a").await.unwrap();
        bob.subscribe("session:a").await.unwrap();
        eve.subscribe("session:b").await.unwrap();

        alice.broadcast(b"hi".to_vec()).await.unwrap();
        bob.unsubscribe().await;
        eve.unsubscribe().await;

        assert_eq!(bob.recv().await, Some(ChannelEvent::Message(b"hi".to_vec())));
        assert!(bob.inbox.try_recv().is_err());
        assert!(eve.inbox.try_recv().is_err());
        assert!(alice.inbox.try_recv().is_err());
        assert_eq!(relay.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn track_publishes_roster_to_everyone() {
        let relay = SimRelay::with_config(RelayConfig { presence_sync: None });
        let mut alice = relay.connect();
        let mut bob = relay.connect();
        alice.subscribe("s").await.unwrap();
        bob.subscribe("s").await.unwrap();

        alice.track(&identity("a")).await.unwrap();
        bob.track(&identity("b")).await.unwrap();

        let both = vec![identity("a"), identity("b")];
        assert_eq!(alice.recv().await, Some(ChannelEvent::Presence(vec![identity("a")])));
        assert_eq!(alice.recv().await, Some(ChannelEvent::Presence(both.clone())));
        assert_eq!(bob.recv().await, Some(ChannelEvent::Presence(vec![identity("a")])));
        assert_eq!(bob.recv().await, Some(ChannelEvent::Presence(both)));
    }

    #[tokio::test]
    async fn dropping_a_channel_updates_the_roster() {
        let relay = SimRelay::with_config(RelayConfig { presence_sync: None });
        let mut alice = relay.connect();
        let mut bob = relay.connect();
        alice.subscribe("s").await.unwrap();
        bob.subscribe("s").await.unwrap();
        alice.track(&identity("a")).await.unwrap();
        bob.track(&identity("b")).await.unwrap();
        while alice.inbox.try_recv().is_ok() {}

        drop(bob);

        assert_eq!(alice.recv().await, Some(ChannelEvent::Presence(vec![identity("a")])));
        assert_eq!(relay.subscriber_count("s"), 1);
    }

    #[tokio::test]
    async fn disconnected_member_sees_end_of_stream() {
        let relay = SimRelay::new();
        let mut alice = relay.connect();
        alice.subscribe("s").await.unwrap();

        relay.disconnect(alice.member_id());

        assert_eq!(alice.recv().await, None);
        assert_eq!(alice.broadcast(vec![1]).await, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn queued_faults_run_out() {
        let relay = SimRelay::new();
        relay.fail_next_subscribes(SubscribeFault::Reject("busy".to_string()), 2);
        let mut alice = relay.connect();

        assert_eq!(alice.subscribe("s").await, Err(ChannelError::Failed("busy".to_string())));
        assert_eq!(alice.subscribe("s").await, Err(ChannelError::Failed("busy".to_string())));
        assert_eq!(alice.subscribe("s").await, Ok(()));
        assert_eq!(relay.subscribe_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_subscribe_never_resolves() {
        let relay = SimRelay::new();
        relay.fail_all_subscribes(SubscribeFault::Hang);
        let mut alice = relay.connect();

        let outcome =
            tokio::time::timeout(Duration::from_secs(60), alice.subscribe("s")).await;

        assert!(outcome.is_err());
        relay.clear_faults();
        assert_eq!(alice.subscribe("s").await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_members_receive_periodic_roster() {
        let relay = SimRelay::new();
        let mut alice = relay.connect();
        alice.subscribe("s").await.unwrap();
        alice.track(&identity("a")).await.unwrap();
        assert_eq!(alice.recv().await, Some(ChannelEvent::Presence(vec![identity("a")])));

        let before = tokio::time::Instant::now();
        let synced = alice.recv().await;

        assert_eq!(synced, Some(ChannelEvent::Presence(vec![identity("a")])));
        assert_eq!(tokio::time::Instant::now() - before, DEFAULT_PRESENCE_SYNC);
    }
}

//! Publish/subscribe channel abstraction.
//!
//! The relay carrying session traffic is external. A [`Channel`] is one
//! participant's handle to it: subscribe to a named channel, register a
//! presence identity, broadcast opaque payloads and receive payloads and
//! roster updates.

use std::future::Future;

use ghost_core::SessionIdentity;

use crate::error::ChannelError;

/// Something the channel delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A broadcast payload (CBOR-encoded envelope)
    Message(Vec<u8>),

    /// Full presence roster after a change
    Presence(Vec<SessionIdentity>),
}

/// One participant's connection to the session relay.
///
/// # Implementations
///
/// - **Production**: a hosted realtime relay client
/// - **Simulation**: `ghost_harness::SimChannel`, an in-memory relay with
///   fault injection
pub trait Channel: Send {
    /// Subscribe to the channel called `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay refuses the subscription.
    fn subscribe(&mut self, name: &str) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Register `identity` in the channel's presence roster.
    ///
    /// # Errors
    ///
    /// Returns an error if not subscribed or the relay fails.
    fn track(
        &mut self,
        identity: &SessionIdentity,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Send `payload` to every subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if not subscribed or the relay fails.
    fn broadcast(&mut self, payload: Vec<u8>)
    -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Next delivered event. `None` once the subscription is gone.
    fn recv(&mut self) -> impl Future<Output = Option<ChannelEvent>> + Send;

    /// Leave the channel. Leaving when not subscribed is a no-op.
    fn unsubscribe(&mut self) -> impl Future<Output = ()> + Send;
}

//! Session controller state machine.
//!
//! The `SessionController` owns everything one ephemeral session holds: the
//! key pair, the derived session key, the voice pipeline, the transport state
//! machine and this session's slice of the message queue. It performs no I/O.
//! Methods return [`SessionAction`]s and the caller reports outcomes back as
//! [`SessionEvent`]s.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ─connected─> KeyExchange ─peer key─> AwaitingVerification ─confirm─> Ready
//!      │                       │                          │                        │
//!      └───────────────────────┴──── terminate() ─────────┴────────────────────────┘
//!                                        │
//!                                        ↓
//!                                   Terminating ─zeroize_local()─> Terminated
//! ```
//!
//! # Termination
//!
//! Termination is debounced and runs at most once. The sequence is emitted as
//! ordered actions, each executed best effort by the runtime:
//!
//! 1. `Broadcast(session-terminated)` (skipped when the peer ended it)
//! 2. `DeleteSession`
//! 3. `ZeroizeLocal`
//!
//! A departed peer, or a peer goodbye, schedules the same sequence after
//! `departure_grace`. Once scheduled it is not cancelled.

use ghost_core::{
    AudioOutput, ChatKind, ChatPayload, CryptoEngine, Envelope, EnvelopeKind, Environment,
    MessageKind, MessageQueue, Playback, QueuedMessage, SealedPayload, Sender, SessionId,
    SessionIdentity, Timers, Transport, TransportAction, TransportError, TransportEvent,
    TransportStatus, VoiceMessage, VoicePipeline,
};
use ghost_crypto::{Fingerprint, KeyPair, PublicKeyBytes, derive_shared_secret, fingerprint};
use zeroize::Zeroizing;

use crate::{
    config::{SessionConfig, VerificationPolicy},
    error::SessionError,
    event::{
        Outgoing, SessionAction, SessionEvent, SessionNotice, SessionPhase, SessionSnapshot,
        TerminationReason,
    },
    markers::Marker,
};

/// Farewell shown when the peer leaves the roster.
const PEER_LEFT_NOTICE: &str = "Peer left the session";

/// Farewell shown when the peer ends the session.
const PEER_ENDED_NOTICE: &str = "Peer ended the session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum SessionTimer {
    DepartureGrace,
    Keepalive,
}

/// Controller for exactly one session.
pub struct SessionController<E: Environment> {
    /// Environment for randomness and timing.
    env: E,

    config: SessionConfig,

    session_id: SessionId,

    /// Our presence identity.
    identity: SessionIdentity,

    phase: SessionPhase,

    /// Ephemeral key pair. Dropped (and zeroized) on local zeroization.
    key_pair: Option<KeyPair>,

    local_fingerprint: Fingerprint,

    /// First valid peer key seen. Never replaced.
    peer_public: Option<PublicKeyBytes>,

    peer_fingerprint: Option<Fingerprint>,

    verified: bool,

    engine: CryptoEngine<E>,

    voice: VoicePipeline<E>,

    /// Shared RAM-only queue; this controller only touches its own session.
    queue: MessageQueue,

    transport: Transport<E::Instant>,

    timers: Timers<SessionTimer, E::Instant>,

    /// When the last termination request was accepted or debounced.
    last_terminate_request: Option<E::Instant>,

    /// Reason for the pending grace-delay termination.
    pending_departure: Option<TerminationReason>,

    /// Set once the termination sequence has been emitted.
    termination: Option<TerminationReason>,

    zeroized: bool,
}

impl<E: Environment> SessionController<E> {
    /// Create a controller for `session_id` with a fresh key pair.
    ///
    /// # Errors
    ///
    /// - `Crypto(InvalidKeyMaterial)` if the environment's RNG cannot produce
    ///   a valid secret scalar
    pub fn new(
        env: E,
        config: SessionConfig,
        session_id: SessionId,
        identity: SessionIdentity,
        queue: MessageQueue,
    ) -> Result<Self, SessionError> {
        let key_pair = KeyPair::generate(|buf| env.random_bytes(buf))?;
        let local_fingerprint = key_pair.fingerprint();
        let transport = Transport::new(config.transport.clone(), identity.clone());

        tracing::debug!(%session_id, fingerprint = %local_fingerprint, "session key pair generated");

        Ok(Self {
            engine: CryptoEngine::new(env.clone()),
            voice: VoicePipeline::new(env.clone(), config.max_played_ids),
            env,
            config,
            session_id,
            identity,
            phase: SessionPhase::Connecting,
            key_pair: Some(key_pair),
            local_fingerprint,
            peer_public: None,
            peer_fingerprint: None,
            verified: false,
            queue,
            transport,
            timers: Timers::new(),
            last_terminate_request: None,
            pending_departure: None,
            termination: None,
            zeroized: false,
        })
    }

    /// Session id.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Session tuning.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Our presence identity.
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Our fingerprint, available from construction.
    pub fn local_fingerprint(&self) -> Fingerprint {
        self.local_fingerprint
    }

    /// Peer fingerprint, once the key exchange completed.
    pub fn peer_fingerprint(&self) -> Option<Fingerprint> {
        self.peer_fingerprint
    }

    /// Lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Whether the termination sequence has started.
    pub fn is_terminated(&self) -> bool {
        self.termination.is_some()
    }

    /// Whether local state has been zeroized.
    pub fn is_zeroized(&self) -> bool {
        self.zeroized
    }

    /// Whether the outcome of channel attempt `attempt` is still wanted.
    /// False once it timed out or the session started terminating.
    pub fn attempt_in_flight(&self, attempt: u32) -> bool {
        !self.is_terminated() && self.transport.attempt_in_flight(attempt)
    }

    /// Earliest pending deadline. The caller should tick then.
    pub fn next_deadline(&self) -> Option<E::Instant> {
        [self.transport.next_deadline(), self.timers.next_deadline()].into_iter().flatten().min()
    }

    /// Read-only view of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            phase: self.phase,
            connection: self.transport.state(),
            local_fingerprint: self.local_fingerprint,
            peer_fingerprint: self.peer_fingerprint,
            verified: self.verified,
            peer_present: self.transport.peer_present(),
            memory: self.queue.memory_stats(&self.session_id),
        }
    }

    /// Snapshot of this session's queued messages.
    pub fn messages(&self) -> Vec<QueuedMessage> {
        self.queue.get_messages(&self.session_id)
    }

    /// Process an event and return actions to execute.
    ///
    /// After local zeroization every event is ignored.
    ///
    /// # Errors
    ///
    /// - `Transport(InvalidState)` if `Start` or `Validated` arrive out of
    ///   order
    pub fn handle(
        &mut self,
        event: SessionEvent<E::Instant>,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.zeroized {
            tracing::debug!(?event, "ignoring event after zeroization");
            return Ok(Vec::new());
        }

        let now = self.env.now();

        match event {
            SessionEvent::Start => self.drive_transport(|t| t.start(now)),
            SessionEvent::Validated(outcome) => {
                self.drive_transport(|t| t.handle_validation(now, outcome))
            },
            SessionEvent::Subscribed { attempt } => {
                self.drive_transport(|t| Ok(t.handle_subscribed(now, attempt)))
            },
            SessionEvent::SubscribeFailed { attempt, reason } => {
                self.drive_transport(|t| Ok(t.handle_subscribe_failed(now, attempt, reason)))
            },
            SessionEvent::PresenceTracked { attempt } => {
                self.drive_transport(|t| Ok(t.handle_presence_tracked(now, attempt)))
            },
            SessionEvent::Presence(roster) => {
                self.drive_transport(|t| Ok(t.handle_presence(now, &roster)))
            },
            SessionEvent::EnvelopeReceived(bytes) => Ok(self.handle_envelope(now, &bytes)),
            SessionEvent::Tick { now } => self.handle_tick(now),
        }
    }

    /// Confirm that the fingerprints match out of band.
    ///
    /// # Errors
    ///
    /// - `Terminated` after termination
    /// - `NotReady` before the peer key arrived
    pub fn confirm_verification(&mut self) -> Result<Vec<SessionAction>, SessionError> {
        if self.is_terminated() {
            return Err(SessionError::Terminated);
        }

        if self.peer_fingerprint.is_none() {
            return Err(SessionError::NotReady);
        }

        if self.verified {
            return Ok(Vec::new());
        }

        self.verified = true;
        self.phase = SessionPhase::Ready;
        tracing::info!(session_id = %self.session_id, "fingerprints confirmed");

        Ok(vec![SessionAction::Notify(SessionNotice::Verified)])
    }

    /// Encrypt and send a text message.
    ///
    /// # Errors
    ///
    /// - `Terminated` after termination
    /// - `NotReady` before the session key exists
    /// - `UnverifiedChannel` before confirmation (policy `Required`)
    pub fn send_text(&mut self, text: &str) -> Result<Outgoing, SessionError> {
        self.ensure_sendable()?;
        self.send_chat(&ChatPayload::text(text))
    }

    /// Encrypt and send a file attachment.
    ///
    /// # Errors
    ///
    /// Same as [`Self::send_text`].
    pub fn send_file(&mut self, name: &str, bytes: &[u8]) -> Result<Outgoing, SessionError> {
        self.ensure_sendable()?;
        self.send_chat(&ChatPayload::file(name, bytes))
    }

    /// Seal captured PCM chunks (16-bit little-endian, 48 kHz mono) as a
    /// one-time voice message and send it.
    ///
    /// # Errors
    ///
    /// Same as [`Self::send_text`], plus `Voice(Malformed)` for chunks that
    /// are not whole samples.
    pub fn send_voice<C: AsRef<[u8]>>(&mut self, chunks: &[C]) -> Result<Outgoing, SessionError> {
        self.ensure_sendable()?;

        let mut capture = self.voice.start_capture()?;
        for chunk in chunks {
            capture.push_chunk(chunk.as_ref())?;
        }
        let voice = capture.finish(true);
        let encoded = voice.encode()?;

        let sealed = self.engine.encrypt(&encoded)?;
        let timestamp = self.env.wall_clock_millis();
        let message_id = sealed.message_id();

        let message =
            QueuedMessage::new(&message_id, encoded, Sender::Local, MessageKind::Voice, timestamp);
        self.queue.add_message(&self.session_id, message);

        tracing::debug!(%message_id, duration_ms = voice.duration_ms, "voice message sent");

        Ok(self.outgoing(EnvelopeKind::VoiceMessage, sealed, message_id, timestamp))
    }

    /// Decrypt and start playing voice message `message_id`.
    ///
    /// One-time messages are consumed by the first call, even if playback is
    /// stopped or fails part-way.
    ///
    /// # Errors
    ///
    /// - `Terminated` after termination
    /// - `MessageNotFound` if no voice message has that id
    /// - `Voice(ReplayViolation)` on a second play
    /// - `Voice(Crypto)` if a chunk fails authentication
    pub fn play_voice<O: AudioOutput>(
        &mut self,
        message_id: &str,
        mut output: O,
    ) -> Result<Playback<O, E>, SessionError> {
        if self.is_terminated() {
            output.release();
            return Err(SessionError::Terminated);
        }

        let voice = match self.queue.get_message(&self.session_id, message_id) {
            Some(message) if message.kind == MessageKind::Voice => {
                VoiceMessage::decode(&message.content)
            },
            _ => {
                output.release();
                return Err(SessionError::MessageNotFound(message_id.to_string()));
            },
        };

        let voice = match voice {
            Ok(voice) => voice,
            Err(err) => {
                output.release();
                return Err(err.into());
            },
        };

        Ok(self.voice.play(message_id, &voice, output)?)
    }

    /// Request termination.
    ///
    /// Silent no-op within `termination_debounce` of the previous request, and
    /// once the session is already terminating.
    pub fn terminate(&mut self) -> Vec<SessionAction> {
        let now = self.env.now();
        self.terminate_with(now, TerminationReason::Local)
    }

    /// Release every piece of local session state.
    ///
    /// Drops the key pair and session key, clears the voice replay set,
    /// destroys this session's queue entries and closes the transport.
    /// Idempotent.
    pub fn zeroize_local(&mut self) -> Vec<SessionAction> {
        if self.zeroized {
            return Vec::new();
        }

        let reason = *self.termination.get_or_insert(TerminationReason::Local);

        self.engine.release();
        self.voice.release();
        self.key_pair = None;
        self.peer_public = None;
        self.verified = false;
        self.pending_departure = None;
        self.queue.destroy_session(&self.session_id);
        self.timers.cancel_all();

        let mut actions = vec![SessionAction::ClearMarkers];
        let before = self.transport.status();
        let closed = self.transport.close();
        actions.extend(self.map_transport(before, closed));

        self.zeroized = true;
        self.phase = SessionPhase::Terminated;
        tracing::info!(session_id = %self.session_id, ?reason, "local session state zeroized");

        actions.push(SessionAction::Notify(SessionNotice::Terminated { reason }));
        actions
    }

    fn ensure_sendable(&self) -> Result<(), SessionError> {
        if self.is_terminated() {
            return Err(SessionError::Terminated);
        }

        if !self.engine.is_initialized() {
            return Err(SessionError::NotReady);
        }

        if self.config.verification == VerificationPolicy::Required && !self.verified {
            return Err(SessionError::UnverifiedChannel);
        }

        Ok(())
    }

    fn send_chat(&mut self, payload: &ChatPayload) -> Result<Outgoing, SessionError> {
        let plaintext = Zeroizing::new(payload.encode()?);
        let sealed = self.engine.encrypt(&plaintext)?;
        let timestamp = self.env.wall_clock_millis();
        let message_id = sealed.message_id();

        let kind = match payload.kind {
            ChatKind::Text => MessageKind::Text,
            ChatKind::File => MessageKind::File,
        };

        let mut message =
            QueuedMessage::new(&message_id, payload.content.clone(), Sender::Local, kind, timestamp);
        if let Some(name) = &payload.file_name {
            message = message.with_file_name(name.as_str());
        }
        self.queue.add_message(&self.session_id, message);

        tracing::debug!(%message_id, ?kind, "chat message sent");

        Ok(self.outgoing(EnvelopeKind::ChatMessage, sealed, message_id, timestamp))
    }

    fn outgoing(
        &self,
        kind: EnvelopeKind,
        sealed: SealedPayload,
        message_id: String,
        timestamp: u64,
    ) -> Outgoing {
        let envelope = Envelope::sealed(kind, self.identity.clone(), sealed, timestamp);
        Outgoing { message_id, actions: vec![SessionAction::Broadcast(envelope)] }
    }

    fn terminate_with(&mut self, now: E::Instant, reason: TerminationReason) -> Vec<SessionAction> {
        if let Some(last) = self.last_terminate_request
            && now - last < self.config.termination_debounce
        {
            tracing::debug!(?reason, "termination request debounced");
            return Vec::new();
        }
        self.last_terminate_request = Some(now);

        if self.termination.is_some() {
            tracing::debug!(?reason, "session already terminating");
            return Vec::new();
        }

        self.termination = Some(reason);
        self.phase = SessionPhase::Terminating;
        self.timers.cancel_all();
        tracing::info!(session_id = %self.session_id, ?reason, "terminating session");

        let mut actions = Vec::with_capacity(3);
        if reason != TerminationReason::PeerTerminated {
            let goodbye = Envelope::terminated(self.identity.clone(), self.env.wall_clock_millis());
            actions.push(SessionAction::Broadcast(goodbye));
        }
        actions.push(SessionAction::DeleteSession { session_id: self.session_id.clone() });
        actions.push(SessionAction::ZeroizeLocal);
        actions
    }

    fn handle_tick(&mut self, now: E::Instant) -> Result<Vec<SessionAction>, SessionError> {
        let mut actions = self.drive_transport(|t| Ok(t.tick(now)))?;

        for timer in self.timers.expire(now) {
            match timer {
                SessionTimer::DepartureGrace => {
                    let reason =
                        self.pending_departure.take().unwrap_or(TerminationReason::PeerDeparted);
                    actions.extend(self.terminate_with(now, reason));
                },
                SessionTimer::Keepalive => {
                    if self.is_terminated() {
                        continue;
                    }
                    if self.transport.status() == TransportStatus::Connected {
                        actions.push(SessionAction::ExtendSession {
                            session_id: self.session_id.clone(),
                        });
                    }
                    self.timers.schedule(SessionTimer::Keepalive, now, self.config.registry_keepalive);
                },
            }
        }

        Ok(actions)
    }

    fn drive_transport(
        &mut self,
        step: impl FnOnce(&mut Transport<E::Instant>) -> Result<Vec<TransportAction>, TransportError>,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let before = self.transport.status();
        let actions = step(&mut self.transport)?;
        Ok(self.map_transport(before, actions))
    }

    fn map_transport(
        &mut self,
        before: TransportStatus,
        transport_actions: Vec<TransportAction>,
    ) -> Vec<SessionAction> {
        let mut actions = Vec::new();

        if self.transport.status() != before {
            actions.push(SessionAction::Notify(SessionNotice::StateChanged(self.transport.state())));
        }

        for action in transport_actions {
            match action {
                TransportAction::ValidateSession => {
                    actions.push(SessionAction::ValidateSession {
                        session_id: self.session_id.clone(),
                    });
                },
                TransportAction::Subscribe { attempt } => {
                    actions.push(SessionAction::Subscribe { channel: self.channel_name(), attempt });
                },
                TransportAction::TrackPresence { attempt } => {
                    actions.push(SessionAction::TrackPresence {
                        identity: self.identity.clone(),
                        attempt,
                    });
                },
                TransportAction::Unsubscribe => actions.push(SessionAction::Unsubscribe),
                TransportAction::Notify(event) => actions.extend(self.on_transport_event(event)),
            }
        }

        actions
    }

    fn on_transport_event(&mut self, event: TransportEvent) -> Vec<SessionAction> {
        let now = self.env.now();

        match event {
            TransportEvent::Connected => {
                if self.phase == SessionPhase::Connecting {
                    self.phase = SessionPhase::KeyExchange;
                }
                self.timers.schedule(SessionTimer::Keepalive, now, self.config.registry_keepalive);
                self.key_announcement().into_iter().collect()
            },
            TransportEvent::Reconnecting => vec![SessionAction::Notify(SessionNotice::Reconnecting)],
            TransportEvent::Reconnected => {
                if self.engine.is_initialized() {
                    Vec::new()
                } else {
                    self.key_announcement().into_iter().collect()
                }
            },
            TransportEvent::PeerPresent => {
                let mut actions = vec![SessionAction::Notify(SessionNotice::PeerPresent)];
                if !self.engine.is_initialized() {
                    actions.extend(self.key_announcement());
                }
                actions
            },
            TransportEvent::PeerDeparted => {
                self.schedule_departure(now, TerminationReason::PeerDeparted)
            },
            TransportEvent::Failed(err) => {
                vec![SessionAction::Notify(SessionNotice::TransportFailed(err))]
            },
            TransportEvent::Closed => Vec::new(),
        }
    }

    fn channel_name(&self) -> String {
        format!("session:{}", self.session_id)
    }

    fn key_announcement(&self) -> Option<SessionAction> {
        let key_pair = self.key_pair.as_ref()?;
        let envelope = Envelope::key_exchange(
            self.identity.clone(),
            key_pair.public_key().as_bytes(),
            self.env.wall_clock_millis(),
        );
        Some(SessionAction::Broadcast(envelope))
    }

    fn schedule_departure(&mut self, now: E::Instant, reason: TerminationReason) -> Vec<SessionAction> {
        if self.pending_departure.is_some() || self.is_terminated() {
            return Vec::new();
        }

        self.transport.suspend_heartbeat();
        self.timers.schedule(SessionTimer::DepartureGrace, now, self.config.departure_grace);
        self.pending_departure = Some(reason);
        tracing::info!(?reason, grace = ?self.config.departure_grace, "peer gone, termination scheduled");

        let farewell = match reason {
            TerminationReason::PeerTerminated => PEER_ENDED_NOTICE,
            TerminationReason::PeerDeparted | TerminationReason::Local => PEER_LEFT_NOTICE,
        };
        let id = format!("system-{:016x}", self.env.random_u64());
        let message = QueuedMessage::new(
            &id,
            farewell.as_bytes().to_vec(),
            Sender::Local,
            MessageKind::System,
            self.env.wall_clock_millis(),
        );
        self.queue.add_message(&self.session_id, message);

        let mut actions = Vec::new();
        if reason == TerminationReason::PeerDeparted {
            actions.push(SessionAction::Notify(SessionNotice::PeerDeparted));
        }
        actions.push(SessionAction::Notify(SessionNotice::MessageReceived {
            id,
            kind: MessageKind::System,
        }));
        actions
    }

    fn handle_envelope(&mut self, now: E::Instant, bytes: &[u8]) -> Vec<SessionAction> {
        self.transport.record_activity(now);

        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable envelope");
                return Vec::new();
            },
        };

        if envelope.sender_id == self.identity {
            return Vec::new();
        }

        if self.is_terminated() && envelope.kind != EnvelopeKind::MessageAck {
            tracing::debug!(kind = ?envelope.kind, "ignoring envelope while terminating");
            return Vec::new();
        }

        match envelope.kind {
            EnvelopeKind::KeyExchange => self.handle_key_exchange(&envelope),
            EnvelopeKind::ChatMessage => self.handle_chat(&envelope),
            EnvelopeKind::VoiceMessage => self.handle_voice(&envelope),
            EnvelopeKind::MessageAck => self.handle_ack(&envelope),
            EnvelopeKind::SessionTerminated => {
                tracing::info!("peer ended the session");
                self.schedule_departure(now, TerminationReason::PeerTerminated)
            },
        }
    }

    fn handle_key_exchange(&mut self, envelope: &Envelope) -> Vec<SessionAction> {
        let peer = match PublicKeyBytes::from_slice(&envelope.data) {
            Ok(peer) => peer,
            Err(err) => {
                tracing::warn!(error = %err, "dropping invalid peer public key");
                return Vec::new();
            },
        };

        if let Some(existing) = &self.peer_public {
            if *existing == peer {
                tracing::debug!("duplicate key announcement");
                return Vec::new();
            }

            let rejected = fingerprint(&peer);
            tracing::warn!(fingerprint = %rejected, "rejecting substituted peer public key");
            return vec![SessionAction::Notify(SessionNotice::KeySubstitution {
                fingerprint: rejected,
            })];
        }

        let Some(key_pair) = &self.key_pair else {
            return Vec::new();
        };

        let key = match derive_shared_secret(key_pair, &peer) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(error = %err, "key agreement failed");
                return Vec::new();
            },
        };

        self.voice.bind_key(key.clone());
        self.engine.initialize(key);

        let peer_fingerprint = fingerprint(&peer);
        self.peer_public = Some(peer);
        self.peer_fingerprint = Some(peer_fingerprint);
        self.phase = SessionPhase::AwaitingVerification;

        tracing::info!(
            local = %self.local_fingerprint,
            peer = %peer_fingerprint,
            "session key derived"
        );

        // Answer once so a peer that joined after our first announcement
        // also derives the key.
        let mut actions: Vec<SessionAction> = self.key_announcement().into_iter().collect();
        actions.push(SessionAction::SetMarker(Marker::VerificationPrompted));
        actions.push(SessionAction::Notify(SessionNotice::FingerprintsReady {
            local: self.local_fingerprint,
            peer: peer_fingerprint,
        }));
        actions
    }

    fn handle_chat(&mut self, envelope: &Envelope) -> Vec<SessionAction> {
        let Some((id, plaintext)) = self.open_envelope(envelope) else {
            return Vec::new();
        };

        let mut payload = match ChatPayload::decode(&plaintext) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed chat payload");
                return Vec::new();
            },
        };

        let kind = match payload.kind {
            ChatKind::Text => MessageKind::Text,
            ChatKind::File => MessageKind::File,
        };

        let mut message = QueuedMessage::new(
            &id,
            std::mem::take(&mut payload.content),
            Sender::Peer,
            kind,
            envelope.timestamp,
        );
        if let Some(name) = payload.file_name.take() {
            message = message.with_file_name(name);
        }

        self.store_inbound(id, kind, message)
    }

    fn handle_voice(&mut self, envelope: &Envelope) -> Vec<SessionAction> {
        let Some((id, plaintext)) = self.open_envelope(envelope) else {
            return Vec::new();
        };

        if let Err(err) = VoiceMessage::decode(&plaintext) {
            tracing::warn!(error = %err, "dropping malformed voice payload");
            return Vec::new();
        }

        let message = QueuedMessage::new(
            &id,
            plaintext.to_vec(),
            Sender::Peer,
            MessageKind::Voice,
            envelope.timestamp,
        );

        self.store_inbound(id, MessageKind::Voice, message)
    }

    fn handle_ack(&mut self, envelope: &Envelope) -> Vec<SessionAction> {
        let Some(id) = envelope.acked_id() else {
            tracing::warn!("dropping malformed acknowledgment");
            return Vec::new();
        };

        if self.queue.acknowledge_message(&self.session_id, id) {
            tracing::debug!(message_id = id, "message acknowledged");
            vec![SessionAction::Notify(SessionNotice::MessageAcknowledged { id: id.to_string() })]
        } else {
            Vec::new()
        }
    }

    fn open_envelope(&self, envelope: &Envelope) -> Option<(String, Zeroizing<Vec<u8>>)> {
        let (Some(nonce), Some(id)) = (envelope.nonce, envelope.message_id()) else {
            tracing::warn!(kind = ?envelope.kind, "dropping sealed envelope without nonce");
            return None;
        };

        match self.engine.decrypt(&envelope.data, &nonce) {
            Ok(plaintext) => Some((id, Zeroizing::new(plaintext))),
            Err(err) => {
                tracing::debug!(message_id = %id, error = %err, "dropping undecryptable payload");
                None
            },
        }
    }

    fn store_inbound(
        &mut self,
        id: String,
        kind: MessageKind,
        message: QueuedMessage,
    ) -> Vec<SessionAction> {
        let added = self.queue.add_message(&self.session_id, message);
        let ack = Envelope::ack(self.identity.clone(), &id, self.env.wall_clock_millis());

        let mut actions = vec![SessionAction::Broadcast(ack)];
        if added {
            tracing::debug!(message_id = %id, ?kind, "message received");
            actions.push(SessionAction::Notify(SessionNotice::MessageReceived { id, kind }));
        } else {
            tracing::debug!(message_id = %id, "duplicate message");
        }
        actions
    }
}

impl<E: Environment> std::fmt::Debug for SessionController<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("session_id", &self.session_id)
            .field("phase", &self.phase)
            .field("transport", &self.transport)
            .field("verified", &self.verified)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use ghost_core::{MemoryStats, VoiceError};

    use super::*;
    use crate::test_support::ManualEnv;

    type Controller = SessionController<ManualEnv>;

    fn session_id() -> SessionId {
        SessionId::parse("GHOST-TEST-0001").unwrap()
    }

    fn controller(env: &ManualEnv, name: &str, config: SessionConfig) -> Controller {
        SessionController::new(
            env.clone(),
            config,
            session_id(),
            SessionIdentity::from_raw(name),
            MessageQueue::new(),
        )
        .unwrap()
    }

    fn connect(c: &mut Controller) -> Vec<SessionAction> {
        let mut actions = c.handle(SessionEvent::Start).unwrap();
        actions.extend(c.handle(SessionEvent::Validated(Ok(()))).unwrap());
        actions.extend(c.handle(SessionEvent::Subscribed { attempt: 0 }).unwrap());
        actions.extend(c.handle(SessionEvent::PresenceTracked { attempt: 0 }).unwrap());
        actions
    }

    fn envelopes(actions: &[SessionAction]) -> Vec<Envelope> {
        actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::Broadcast(envelope) => Some(envelope.clone()),
                _ => None,
            })
            .collect()
    }

    fn notices(actions: &[SessionAction]) -> Vec<SessionNotice> {
        actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::Notify(notice) => Some(notice.clone()),
                _ => None,
            })
            .collect()
    }

    fn deliver(to: &mut Controller, actions: &[SessionAction]) -> Vec<SessionAction> {
        let mut produced = Vec::new();
        for envelope in envelopes(actions) {
            let bytes = envelope.encode().unwrap();
            produced.extend(to.handle(SessionEvent::EnvelopeReceived(bytes)).unwrap());
        }
        produced
    }

    /// Two connected controllers that completed the key exchange.
    fn exchanged(config: SessionConfig) -> (ManualEnv, Controller, Controller) {
        let env = ManualEnv::new(1);
        let mut alice = controller(&env, "alice", config.clone());
        let mut bob = controller(&env.with_seed(2), "bob", config);

        let from_alice = connect(&mut alice);
        let from_bob = connect(&mut bob);

        let bob_reply = deliver(&mut bob, &from_alice);
        let alice_reply = deliver(&mut alice, &from_bob);
        assert!(envelopes(&deliver(&mut bob, &alice_reply)).is_empty());
        assert!(envelopes(&deliver(&mut alice, &bob_reply)).is_empty());

        (env, alice, bob)
    }

    fn verified() -> (ManualEnv, Controller, Controller) {
        let (env, mut alice, mut bob) = exchanged(SessionConfig::default());
        alice.confirm_verification().unwrap();
        bob.confirm_verification().unwrap();
        (env, alice, bob)
    }

    #[derive(Clone, Default)]
    struct RecordingOutput {
        rendered: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
    }

    impl AudioOutput for RecordingOutput {
        fn render(&mut self, samples: &[f32]) -> Result<(), VoiceError> {
            self.rendered.fetch_add(samples.len(), Ordering::SeqCst);
            Ok(())
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn connect_announces_public_key() {
        let env = ManualEnv::new(1);
        let mut alice = controller(&env, "alice", SessionConfig::default());

        let actions = connect(&mut alice);

        let sent = envelopes(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, EnvelopeKind::KeyExchange);
        assert_eq!(alice.phase(), SessionPhase::KeyExchange);
        assert!(actions.contains(&SessionAction::Subscribe {
            channel: "session:GHOST-TEST-0001".to_string(),
            attempt: 0,
        }));
    }

    #[test]
    fn key_exchange_yields_crossed_fingerprints() {
        let (_env, alice, bob) = exchanged(SessionConfig::default());

        assert_eq!(alice.peer_fingerprint(), Some(bob.local_fingerprint()));
        assert_eq!(bob.peer_fingerprint(), Some(alice.local_fingerprint()));
        assert_eq!(alice.phase(), SessionPhase::AwaitingVerification);
        assert_ne!(alice.local_fingerprint(), bob.local_fingerprint());
    }

    #[test]
    fn first_peer_key_prompts_verification() {
        let env = ManualEnv::new(1);
        let mut alice = controller(&env, "alice", SessionConfig::default());
        let mut bob = controller(&env.with_seed(2), "bob", SessionConfig::default());
        connect(&mut alice);
        let from_bob = connect(&mut bob);

        let actions = deliver(&mut alice, &from_bob);

        assert!(actions.contains(&SessionAction::SetMarker(Marker::VerificationPrompted)));
        assert!(notices(&actions).contains(&SessionNotice::FingerprintsReady {
            local: alice.local_fingerprint(),
            peer: bob.local_fingerprint(),
        }));
        // Our key is re-announced once for the late joiner
        assert_eq!(envelopes(&actions)[0].kind, EnvelopeKind::KeyExchange);
    }

    #[test]
    fn sending_is_gated_until_verified() {
        let env = ManualEnv::new(1);
        let mut lonely = controller(&env, "alice", SessionConfig::default());
        assert_eq!(lonely.send_text("hi").unwrap_err(), SessionError::NotReady);

        let (_env, mut alice, _bob) = exchanged(SessionConfig::default());
        assert_eq!(alice.send_text("hi").unwrap_err(), SessionError::UnverifiedChannel);
        assert_eq!(alice.send_file("a.txt", b"x").unwrap_err(), SessionError::UnverifiedChannel);

        alice.confirm_verification().unwrap();
        assert!(alice.send_text("hi").is_ok());
    }

    #[test]
    fn advisory_policy_allows_unverified_send() {
        let config =
            SessionConfig { verification: VerificationPolicy::Advisory, ..SessionConfig::default() };
        let (_env, mut alice, _bob) = exchanged(config);

        assert!(alice.send_text("hi").is_ok());
    }

    #[test]
    fn confirm_before_key_exchange_is_not_ready() {
        let env = ManualEnv::new(1);
        let mut alice = controller(&env, "alice", SessionConfig::default());

        assert_eq!(alice.confirm_verification().unwrap_err(), SessionError::NotReady);
    }

    #[test]
    fn text_message_is_stored_and_acknowledged() {
        let (_env, mut alice, mut bob) = verified();

        let outgoing = alice.send_text("hello").unwrap();
        let received = deliver(&mut bob, &outgoing.actions);

        assert!(notices(&received).contains(&SessionNotice::MessageReceived {
            id: outgoing.message_id.clone(),
            kind: MessageKind::Text,
        }));
        let stored = bob.messages();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, b"hello");
        assert_eq!(stored[0].sender, Sender::Peer);

        let acked = deliver(&mut alice, &received);
        assert_eq!(
            notices(&acked),
            vec![SessionNotice::MessageAcknowledged { id: outgoing.message_id.clone() }]
        );
        assert!(alice.messages()[0].acknowledged);
    }

    #[test]
    fn file_message_keeps_its_name() {
        let (_env, mut alice, mut bob) = verified();

        let outgoing = alice.send_file("notes.txt", b"file body").unwrap();
        deliver(&mut bob, &outgoing.actions);

        let stored = bob.messages();
        assert_eq!(stored[0].kind, MessageKind::File);
        assert_eq!(stored[0].file_name.as_deref(), Some("notes.txt"));
        assert_eq!(stored[0].content, b"file body");
    }

    #[test]
    fn duplicate_delivery_is_acked_but_stored_once() {
        let (_env, mut alice, mut bob) = verified();

        let outgoing = alice.send_text("once").unwrap();
        deliver(&mut bob, &outgoing.actions);
        let again = deliver(&mut bob, &outgoing.actions);

        assert_eq!(envelopes(&again)[0].kind, EnvelopeKind::MessageAck);
        assert!(notices(&again).is_empty());
        assert_eq!(bob.messages().len(), 1);
    }

    #[test]
    fn tampered_payload_is_dropped_silently() {
        let (_env, mut alice, mut bob) = verified();

        let mut envelope = envelopes(&alice.send_text("hello").unwrap().actions).remove(0);
        envelope.data[0] ^= 0x01;
        let bytes = envelope.encode().unwrap();

        let actions = bob.handle(SessionEvent::EnvelopeReceived(bytes)).unwrap();

        assert!(actions.is_empty());
        assert!(bob.messages().is_empty());

        // Processing continues
        let next = alice.send_text("still here").unwrap();
        deliver(&mut bob, &next.actions);
        assert_eq!(bob.messages().len(), 1);
    }

    #[test]
    fn garbage_envelope_is_ignored() {
        let (_env, _alice, mut bob) = verified();

        let actions = bob.handle(SessionEvent::EnvelopeReceived(vec![0xFF, 0x00, 0x13])).unwrap();

        assert!(actions.is_empty());
    }

    #[test]
    fn substituted_key_is_rejected() {
        let (env, mut alice, mut bob) = verified();
        let mut mallory = controller(&env.with_seed(3), "mallory", SessionConfig::default());
        let from_mallory = connect(&mut mallory);

        let actions = deliver(&mut alice, &from_mallory);

        assert_eq!(
            notices(&actions),
            vec![SessionNotice::KeySubstitution { fingerprint: mallory.local_fingerprint() }]
        );
        assert_eq!(alice.peer_fingerprint(), Some(bob.local_fingerprint()));

        // The original key still works
        let outgoing = alice.send_text("after").unwrap();
        deliver(&mut bob, &outgoing.actions);
        assert_eq!(bob.messages()[0].content, b"after");
    }

    #[test]
    fn own_envelopes_are_ignored() {
        let env = ManualEnv::new(1);
        let mut alice = controller(&env, "alice", SessionConfig::default());
        let own = connect(&mut alice);

        let actions = deliver(&mut alice, &own);

        assert!(actions.is_empty());
        assert_eq!(alice.peer_fingerprint(), None);
    }

    #[test]
    fn termination_runs_broadcast_delete_zeroize_in_order() {
        let (_env, mut alice, _bob) = verified();

        let actions = alice.terminate();

        assert_eq!(actions.len(), 3);
        assert!(matches!(
            &actions[0],
            SessionAction::Broadcast(envelope) if envelope.kind == EnvelopeKind::SessionTerminated
        ));
        assert_eq!(actions[1], SessionAction::DeleteSession { session_id: session_id() });
        assert_eq!(actions[2], SessionAction::ZeroizeLocal);
        assert_eq!(alice.phase(), SessionPhase::Terminating);
    }

    #[test]
    fn termination_is_debounced_and_idempotent() {
        let (env, mut alice, _bob) = verified();

        assert_eq!(alice.terminate().len(), 3);

        env.advance(Duration::from_millis(1999));
        assert!(alice.terminate().is_empty());

        env.advance(Duration::from_secs(5));
        assert!(alice.terminate().is_empty());
    }

    #[test]
    fn termination_abandons_subscribe_attempt() {
        let env = ManualEnv::new(1);
        let mut alice = controller(&env, "alice", SessionConfig::default());
        alice.handle(SessionEvent::Start).unwrap();
        alice.handle(SessionEvent::Validated(Ok(()))).unwrap();
        assert!(alice.attempt_in_flight(0));

        let mut actions = alice.terminate();
        assert!(!alice.attempt_in_flight(0));
        assert!(actions.contains(&SessionAction::ZeroizeLocal));

        actions.extend(alice.zeroize_local());
        assert!(!actions.iter().any(|a| matches!(a, SessionAction::Subscribe { .. })));
        assert_eq!(alice.next_deadline(), None);
        assert!(alice.handle(SessionEvent::Subscribed { attempt: 0 }).unwrap().is_empty());
    }

    #[test]
    fn zeroize_releases_everything() {
        let (_env, mut alice, mut bob) = verified();
        let outgoing = bob.send_text("secret").unwrap();
        deliver(&mut alice, &outgoing.actions);
        assert_eq!(alice.snapshot().memory.count, 1);

        alice.terminate();
        let actions = alice.zeroize_local();

        assert_eq!(actions[0], SessionAction::ClearMarkers);
        assert!(actions.contains(&SessionAction::Unsubscribe));
        assert!(
            notices(&actions)
                .contains(&SessionNotice::Terminated { reason: TerminationReason::Local })
        );
        assert!(alice.is_zeroized());
        assert!(alice.messages().is_empty());
        assert_eq!(alice.snapshot().memory, MemoryStats::default());
        assert_eq!(alice.snapshot().connection.status, TransportStatus::Disconnected);
        assert_eq!(alice.next_deadline(), None);
        assert_eq!(alice.send_text("x").unwrap_err(), SessionError::Terminated);

        assert!(alice.zeroize_local().is_empty());
    }

    #[test]
    fn events_after_zeroize_are_ignored() {
        let (_env, mut alice, mut bob) = verified();
        alice.terminate();
        alice.zeroize_local();

        let outgoing = bob.send_text("late").unwrap();
        let actions = deliver(&mut alice, &outgoing.actions);

        assert!(actions.is_empty());
        assert!(alice.messages().is_empty());
    }

    #[test]
    fn peer_departure_terminates_after_grace() {
        let (env, mut alice, bob) = verified();
        let both = vec![alice.identity().clone(), bob.identity().clone()];
        let only_alice = vec![alice.identity().clone()];

        let present = alice.handle(SessionEvent::Presence(both.clone())).unwrap();
        assert!(notices(&present).contains(&SessionNotice::PeerPresent));

        let departed = alice.handle(SessionEvent::Presence(only_alice)).unwrap();
        assert!(notices(&departed).contains(&SessionNotice::PeerDeparted));
        assert!(!departed.contains(&SessionAction::ZeroizeLocal));

        // A re-join during the grace delay does not cancel it
        alice.handle(SessionEvent::Presence(both)).unwrap();

        env.advance(Duration::from_millis(1499));
        let early = alice.handle(SessionEvent::Tick { now: env.now() }).unwrap();
        assert!(!early.contains(&SessionAction::ZeroizeLocal));

        env.advance(Duration::from_millis(1));
        let due = alice.handle(SessionEvent::Tick { now: env.now() }).unwrap();
        assert!(due.contains(&SessionAction::DeleteSession { session_id: session_id() }));
        assert!(due.contains(&SessionAction::ZeroizeLocal));

        let farewell = alice.zeroize_local();
        assert!(notices(&farewell).contains(&SessionNotice::Terminated {
            reason: TerminationReason::PeerDeparted
        }));
    }

    #[test]
    fn peer_goodbye_terminates_without_echo() {
        let (env, mut alice, mut bob) = verified();

        let goodbye = bob.terminate();
        let scheduled = deliver(&mut alice, &goodbye);
        assert!(!scheduled.contains(&SessionAction::ZeroizeLocal));
        assert_eq!(alice.messages()[0].kind, MessageKind::System);

        env.advance(Duration::from_millis(1500));
        let due = alice.handle(SessionEvent::Tick { now: env.now() }).unwrap();

        assert!(envelopes(&due).is_empty());
        assert_eq!(
            due,
            vec![SessionAction::DeleteSession { session_id: session_id() }, SessionAction::ZeroizeLocal]
        );
    }

    #[test]
    fn departure_suppresses_stale_reconnect() {
        let (env, mut alice, bob) = verified();
        alice
            .handle(SessionEvent::Presence(vec![alice.identity().clone(), bob.identity().clone()]))
            .unwrap();
        alice.handle(SessionEvent::Presence(vec![alice.identity().clone()])).unwrap();

        // Jump past the stale window in one tick
        env.advance(Duration::from_secs(40));
        let actions = alice.handle(SessionEvent::Tick { now: env.now() }).unwrap();

        assert!(!notices(&actions).contains(&SessionNotice::Reconnecting));
        assert!(actions.contains(&SessionAction::ZeroizeLocal));
    }

    #[test]
    fn voice_message_plays_exactly_once() {
        let (_env, mut alice, mut bob) = verified();
        let pcm: Vec<u8> = (0..960i16).flat_map(i16::to_le_bytes).collect();

        let outgoing = alice.send_voice(&[pcm.clone(), pcm]).unwrap();
        deliver(&mut bob, &outgoing.actions);

        let recorder = RecordingOutput::default();
        let report = bob.play_voice(&outgoing.message_id, recorder.clone()).unwrap().run_to_end().unwrap();
        assert_eq!(report.samples_rendered, 1920);
        assert_eq!(report.duration_ms, 40);
        assert!(recorder.released.load(Ordering::SeqCst));

        let replay = bob.play_voice(&outgoing.message_id, RecordingOutput::default());
        assert!(matches!(
            replay,
            Err(SessionError::Voice(VoiceError::ReplayViolation { .. }))
        ));
    }

    #[test]
    fn playing_unknown_message_releases_output() {
        let (_env, _alice, mut bob) = verified();
        let recorder = RecordingOutput::default();

        let result = bob.play_voice("0011", recorder.clone());

        assert!(matches!(result, Err(SessionError::MessageNotFound(_))));
        assert!(recorder.released.load(Ordering::SeqCst));
    }

    #[test]
    fn keepalive_extends_registry_entry_while_connected() {
        let (env, mut alice, _bob) = verified();
        // Keep the channel fresh so the heartbeat does not reconnect
        for _ in 0..30 {
            env.advance(Duration::from_secs(10));
            alice.handle(SessionEvent::Presence(vec![alice.identity().clone()])).unwrap();
            let actions = alice.handle(SessionEvent::Tick { now: env.now() }).unwrap();
            if actions.contains(&SessionAction::ExtendSession { session_id: session_id() }) {
                assert_eq!(env.now(), Duration::from_secs(300));
                return;
            }
        }
        panic!("no keepalive within five minutes");
    }

    #[test]
    fn next_deadline_tracks_earliest_timer() {
        let env = ManualEnv::new(1);
        let mut alice = controller(&env, "alice", SessionConfig::default());
        assert_eq!(alice.next_deadline(), None);

        alice.handle(SessionEvent::Start).unwrap();
        alice.handle(SessionEvent::Validated(Ok(()))).unwrap();

        assert_eq!(alice.next_deadline(), Some(Duration::from_secs(3)));
    }
}

//! Async runtime for one session.
//!
//! The [`Runtime`] owns the I/O of a session and drives its
//! [`SessionController`]:
//! - Executes controller actions against the [`Channel`], the
//!   [`SessionRegistry`] and [`LocalMarkers`]
//! - Feeds channel deliveries and action outcomes back as events
//! - Sleeps until the controller's next deadline and ticks it
//! - Serves application commands arriving through a [`SessionHandle`]
//!
//! Every action is best effort. A failed broadcast or registry call is
//! logged and the remaining actions still run, so the termination sequence
//! always reaches local zeroization.
//!
//! # Channel attempts
//!
//! A subscribe or track call can hang. While one is outstanding the runtime
//! keeps serving commands and deadlines; actions they produce wait until the
//! attempt settles. The call is dropped as soon as the controller stops
//! waiting for it, on its timeout or when the session starts terminating, so
//! a terminate never waits for a stuck relay.

use std::{collections::VecDeque, time::Duration};

use ghost_core::{
    AudioOutput, Environment, MessageQueue, PlaybackReport, QueuedMessage, SessionId,
    SessionIdentity,
};
use ghost_crypto::Fingerprint;
use tokio::sync::{mpsc, oneshot};
use zeroize::Zeroizing;

use crate::{
    channel::{Channel, ChannelEvent},
    config::SessionConfig,
    controller::SessionController,
    error::SessionError,
    event::{Outgoing, SessionAction, SessionEvent, SessionNotice, SessionSnapshot},
    markers::LocalMarkers,
    registry::SessionRegistry,
};

/// Pending application commands before senders wait.
const COMMAND_BUFFER: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Reply owed to a command once its actions have run.
type Completion = Box<dyn FnOnce() + Send>;

/// Controller side of a command: actions to execute, then the reply.
struct Applied {
    actions: Vec<SessionAction>,
    reply: Option<Completion>,
}

impl Applied {
    fn new<T: Send + 'static>(
        actions: Vec<SessionAction>,
        reply: Reply<T>,
        result: Result<T, SessionError>,
    ) -> Self {
        Self {
            actions,
            reply: Some(Box::new(move || {
                let _ = reply.send(result);
            })),
        }
    }

    fn actions(actions: Vec<SessionAction>) -> Self {
        Self { actions, reply: None }
    }

    fn outgoing(result: Result<Outgoing, SessionError>, reply: Reply<String>) -> Self {
        match result {
            Ok(outgoing) => Self::new(outgoing.actions, reply, Ok(outgoing.message_id)),
            Err(err) => Self::new(Vec::new(), reply, Err(err)),
        }
    }
}

enum ChannelAttempt {
    Subscribe(String),
    Track(SessionIdentity),
}

enum SessionCommand {
    SendText { text: Zeroizing<String>, reply: Reply<String> },
    SendFile { name: String, bytes: Zeroizing<Vec<u8>>, reply: Reply<String> },
    SendVoice { chunks: Vec<Zeroizing<Vec<u8>>>, reply: Reply<String> },
    PlayVoice { message_id: String, output: Box<dyn AudioOutput + Send>, reply: Reply<PlaybackReport> },
    ConfirmVerification { reply: Reply<()> },
    Terminate { reply: Reply<()> },
    Snapshot { reply: Reply<SessionSnapshot> },
    Messages { reply: Reply<Vec<QueuedMessage>> },
}

/// Application handle to a running session.
///
/// Cheap to clone. Every method fails with `RuntimeStopped` once the session
/// has been zeroized and its runtime has exited.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SendText { .. } => "SendText",
            Self::SendFile { .. } => "SendFile",
            Self::SendVoice { .. } => "SendVoice",
            Self::PlayVoice { .. } => "PlayVoice",
            Self::ConfirmVerification { .. } => "ConfirmVerification",
            Self::Terminate { .. } => "Terminate",
            Self::Snapshot { .. } => "Snapshot",
            Self::Messages { .. } => "Messages",
        };
        f.write_str(name)
    }
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands.send(build(reply)).await.map_err(|_| SessionError::RuntimeStopped)?;
        response.await.map_err(|_| SessionError::RuntimeStopped)?
    }

    /// Send a text message. Returns its message id.
    ///
    /// # Errors
    ///
    /// See [`SessionController::send_text`].
    pub async fn send_text(&self, text: &str) -> Result<String, SessionError> {
        let text = Zeroizing::new(text.to_string());
        self.request(|reply| SessionCommand::SendText { text, reply }).await
    }

    /// Send a file attachment. Returns its message id.
    ///
    /// # Errors
    ///
    /// See [`SessionController::send_file`].
    pub async fn send_file(&self, name: &str, bytes: &[u8]) -> Result<String, SessionError> {
        let name = name.to_string();
        let bytes = Zeroizing::new(bytes.to_vec());
        self.request(|reply| SessionCommand::SendFile { name, bytes, reply }).await
    }

    /// Send captured PCM chunks as a one-time voice message. Returns its
    /// message id.
    ///
    /// # Errors
    ///
    /// See [`SessionController::send_voice`].
    pub async fn send_voice(&self, chunks: Vec<Vec<u8>>) -> Result<String, SessionError> {
        let chunks = chunks.into_iter().map(Zeroizing::new).collect();
        self.request(|reply| SessionCommand::SendVoice { chunks, reply }).await
    }

    /// Play voice message `message_id` into `output` to the end.
    ///
    /// # Errors
    ///
    /// See [`SessionController::play_voice`].
    pub async fn play_voice(
        &self,
        message_id: &str,
        output: Box<dyn AudioOutput + Send>,
    ) -> Result<PlaybackReport, SessionError> {
        let message_id = message_id.to_string();
        self.request(|reply| SessionCommand::PlayVoice { message_id, output, reply }).await
    }

    /// Confirm that the fingerprints match.
    ///
    /// # Errors
    ///
    /// See [`SessionController::confirm_verification`].
    pub async fn confirm_verification(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::ConfirmVerification { reply }).await
    }

    /// End the session. Debounced and idempotent.
    ///
    /// # Errors
    ///
    /// - `RuntimeStopped` if the session is already gone
    pub async fn terminate(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Terminate { reply }).await
    }

    /// Read-only view of the session.
    ///
    /// # Errors
    ///
    /// - `RuntimeStopped` if the session is already gone
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    /// Snapshot of the queued messages.
    ///
    /// # Errors
    ///
    /// - `RuntimeStopped` if the session is already gone
    pub async fn messages(&self) -> Result<Vec<QueuedMessage>, SessionError> {
        self.request(|reply| SessionCommand::Messages { reply }).await
    }
}

/// Runtime that owns a session's I/O.
///
/// # Type Parameters
///
/// - `C`: channel to the session relay
/// - `R`: backend session registry
/// - `M`: local marker store
/// - `E`: environment for time and randomness
pub struct Runtime<C, R, M, E>
where
    C: Channel,
    R: SessionRegistry,
    M: LocalMarkers,
    E: Environment,
{
    env: E,
    controller: SessionController<E>,
    channel: C,
    registry: R,
    markers: M,
    commands: mpsc::Receiver<SessionCommand>,
    commands_open: bool,
    notices: mpsc::UnboundedSender<SessionNotice>,
    subscribed: bool,
}

impl<C, R, M, E> Runtime<C, R, M, E>
where
    C: Channel,
    R: SessionRegistry,
    M: LocalMarkers,
    E: Environment,
{
    /// Wrap `controller` with its I/O. Returns the runtime, a handle for
    /// commands and the stream of notices.
    pub fn new(
        env: E,
        controller: SessionController<E>,
        channel: C,
        registry: R,
        markers: M,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionNotice>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let runtime = Self {
            env,
            controller,
            channel,
            registry,
            markers,
            commands: command_rx,
            commands_open: true,
            notices: notice_tx,
            subscribed: false,
        };

        (runtime, SessionHandle { commands: command_tx }, notice_rx)
    }

    /// Run until the session is zeroized.
    ///
    /// Dropping every [`SessionHandle`] terminates the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot start.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let actions = self.controller.handle(SessionEvent::Start)?;
        self.execute(actions).await;

        while !self.controller.is_zeroized() {
            let tick = sleep_until_deadline(&self.env, &self.controller);

            tokio::select! {
                command = self.commands.recv(), if self.commands_open => {
                    let applied = apply(&mut self.controller, &mut self.commands_open, command);
                    self.execute(applied.actions).await;
                    if let Some(reply) = applied.reply {
                        reply();
                    }
                },
                delivery = self.channel.recv(), if self.subscribed => match delivery {
                    Some(ChannelEvent::Message(bytes)) => {
                        self.dispatch(SessionEvent::EnvelopeReceived(bytes)).await;
                    },
                    Some(ChannelEvent::Presence(roster)) => {
                        self.dispatch(SessionEvent::Presence(roster)).await;
                    },
                    None => {
                        tracing::debug!("channel delivery stream ended");
                        self.subscribed = false;
                    },
                },
                () = tick => {
                    let now = self.env.now();
                    self.dispatch(SessionEvent::Tick { now }).await;
                },
            }
        }

        tracing::info!(session_id = %self.controller.session_id(), "session runtime stopped");
        Ok(())
    }

    async fn dispatch(&mut self, event: SessionEvent<E::Instant>) {
        let actions = feed(&mut self.controller, event);
        self.execute(actions).await;
    }

    /// Execute actions in order. Actions produced while executing (outcomes
    /// fed back into the controller, commands served during a channel
    /// attempt) run after the current batch. Replies to those commands are
    /// sent once everything ran.
    async fn execute(&mut self, actions: Vec<SessionAction>) {
        let mut pending: VecDeque<SessionAction> = actions.into();
        let mut replies: Vec<Completion> = Vec::new();

        while let Some(action) = pending.pop_front() {
            match action {
                SessionAction::Broadcast(envelope) => {
                    let bytes = match envelope.encode() {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            tracing::warn!(kind = ?envelope.kind, error = %err, "envelope encoding failed");
                            continue;
                        },
                    };
                    if let Err(err) = self.channel.broadcast(bytes).await {
                        tracing::warn!(kind = ?envelope.kind, error = %err, "broadcast failed");
                    }
                },
                SessionAction::ValidateSession { session_id } => {
                    let outcome = match self.registry.validate(&session_id).await {
                        Ok(true) => Ok(()),
                        Ok(false) => Err(format!("session {session_id} does not exist")),
                        Err(err) => Err(format!("{err} [{}]", err.code())),
                    };
                    pending.extend(feed(&mut self.controller, SessionEvent::Validated(outcome)));
                },
                SessionAction::Subscribe { channel, attempt } => {
                    for applied in self.attempt(ChannelAttempt::Subscribe(channel), attempt).await {
                        pending.extend(applied.actions);
                        replies.extend(applied.reply);
                    }
                },
                SessionAction::TrackPresence { identity, attempt } => {
                    for applied in self.attempt(ChannelAttempt::Track(identity), attempt).await {
                        pending.extend(applied.actions);
                        replies.extend(applied.reply);
                    }
                },
                SessionAction::Unsubscribe => {
                    self.channel.unsubscribe().await;
                    self.subscribed = false;
                },
                SessionAction::DeleteSession { session_id } => {
                    if let Err(err) = self.registry.delete_session(&session_id).await {
                        tracing::warn!(%session_id, code = err.code(), error = %err, "registry delete failed");
                    }
                },
                SessionAction::ExtendSession { session_id } => {
                    if let Err(err) = self.registry.extend(&session_id).await {
                        tracing::warn!(%session_id, code = err.code(), error = %err, "registry keepalive failed");
                    }
                },
                SessionAction::SetMarker(marker) => {
                    self.markers.set(self.controller.session_id(), marker);
                },
                SessionAction::ClearMarkers => self.markers.clear(self.controller.session_id()),
                SessionAction::ZeroizeLocal => pending.extend(self.controller.zeroize_local()),
                SessionAction::Notify(notice) => {
                    if self.notices.send(notice).is_err() {
                        tracing::debug!("notice receiver dropped");
                    }
                },
            }
        }

        for reply in replies {
            reply();
        }
    }

    /// Drive one subscribe or track call to its outcome, serving commands
    /// and deadlines meanwhile.
    ///
    /// Returns, in order, what was applied while waiting and the controller's
    /// reaction to the outcome. The call is abandoned once the controller no
    /// longer waits for `attempt`.
    async fn attempt(&mut self, op: ChannelAttempt, attempt: u32) -> Vec<Applied> {
        let subscribing = matches!(op, ChannelAttempt::Subscribe(_));
        let channel = &mut self.channel;
        let call = async move {
            match &op {
                ChannelAttempt::Subscribe(name) => channel.subscribe(name).await,
                ChannelAttempt::Track(identity) => channel.track(identity).await,
            }
        };
        tokio::pin!(call);

        let mut applied = Vec::new();

        loop {
            let tick = sleep_until_deadline(&self.env, &self.controller);

            tokio::select! {
                result = &mut call => {
                    let event = match result {
                        Ok(()) if subscribing => {
                            self.subscribed = true;
                            SessionEvent::Subscribed { attempt }
                        },
                        Ok(()) => SessionEvent::PresenceTracked { attempt },
                        Err(err) => SessionEvent::SubscribeFailed { attempt, reason: err.to_string() },
                    };
                    applied.push(Applied::actions(feed(&mut self.controller, event)));
                    return applied;
                },
                command = self.commands.recv(), if self.commands_open => {
                    applied.push(apply(&mut self.controller, &mut self.commands_open, command));
                },
                () = tick => {
                    let now = self.env.now();
                    applied.push(Applied::actions(feed(&mut self.controller, SessionEvent::Tick { now })));
                },
            }

            if !self.controller.attempt_in_flight(attempt) {
                tracing::debug!(attempt, "channel attempt abandoned");
                return applied;
            }
        }
    }
}

/// Run `command` against the controller. A closed command queue means
/// every handle is gone, which ends the session.
fn apply<E: Environment>(
    controller: &mut SessionController<E>,
    commands_open: &mut bool,
    command: Option<SessionCommand>,
) -> Applied {
    let Some(command) = command else {
        tracing::info!("all session handles dropped, terminating");
        *commands_open = false;
        return Applied::actions(controller.terminate());
    };

    tracing::debug!(?command, "session command");

    match command {
        SessionCommand::SendText { text, reply } => {
            Applied::outgoing(controller.send_text(&text), reply)
        },
        SessionCommand::SendFile { name, bytes, reply } => {
            Applied::outgoing(controller.send_file(&name, &bytes), reply)
        },
        SessionCommand::SendVoice { chunks, reply } => {
            Applied::outgoing(controller.send_voice(&chunks), reply)
        },
        SessionCommand::PlayVoice { message_id, output, reply } => {
            let result = controller
                .play_voice(&message_id, output)
                .and_then(|playback| playback.run_to_end().map_err(SessionError::from));
            Applied::new(Vec::new(), reply, result)
        },
        SessionCommand::ConfirmVerification { reply } => {
            match controller.confirm_verification() {
                Ok(actions) => Applied::new(actions, reply, Ok(())),
                Err(err) => Applied::new(Vec::new(), reply, Err(err)),
            }
        },
        SessionCommand::Terminate { reply } => {
            Applied::new(controller.terminate(), reply, Ok(()))
        },
        SessionCommand::Snapshot { reply } => {
            Applied::new(Vec::new(), reply, Ok(controller.snapshot()))
        },
        SessionCommand::Messages { reply } => {
            Applied::new(Vec::new(), reply, Ok(controller.messages()))
        },
    }
}

fn feed<E: Environment>(
    controller: &mut SessionController<E>,
    event: SessionEvent<E::Instant>,
) -> Vec<SessionAction> {
    match controller.handle(event) {
        Ok(actions) => actions,
        Err(err) => {
            tracing::warn!(error = %err, "session event rejected");
            Vec::new()
        },
    }
}

/// Sleep until the controller's next deadline, or forever if it has none.
fn sleep_until_deadline<E: Environment>(
    env: &E,
    controller: &SessionController<E>,
) -> impl Future<Output = ()> + use<E> {
    let wake = controller.next_deadline().map(|deadline| {
        let now = env.now();
        if deadline > now { deadline - now } else { Duration::ZERO }
    });
    let env = env.clone();

    async move {
        match wake {
            Some(after) => env.sleep(after).await,
            None => std::future::pending::<()>().await,
        }
    }
}

/// Create a new session and reserve its id with the registry.
///
/// The reservation is attempted once.
///
/// # Errors
///
/// - `Crypto` if key generation fails
/// - `Registry` if the reservation fails
pub async fn create_session<E, R>(
    env: E,
    config: SessionConfig,
    queue: MessageQueue,
    registry: &R,
    device_attributes: &[&str],
) -> Result<SessionController<E>, SessionError>
where
    E: Environment,
    R: SessionRegistry,
{
    let session_id = SessionId::generate(&env);
    let identity = SessionIdentity::generate(&env, device_attributes);
    let controller = SessionController::new(env, config, session_id, identity, queue)?;

    let fingerprint: Fingerprint = controller.local_fingerprint();
    if let Err(err) = registry.reserve(controller.session_id(), &fingerprint).await {
        tracing::warn!(code = err.code(), error = %err, "session reservation failed");
        return Err(err.into());
    }

    tracing::info!(session_id = %controller.session_id(), "session created");
    Ok(controller)
}

/// Prepare to join an existing session by id.
///
/// The id is checked against the registry when the runtime starts.
///
/// # Errors
///
/// - `Identity` if `session_id` is not of the form `GHOST-XXXX-XXXX`
/// - `Crypto` if key generation fails
pub fn join_session<E: Environment>(
    env: E,
    config: SessionConfig,
    queue: MessageQueue,
    session_id: &str,
    device_attributes: &[&str],
) -> Result<SessionController<E>, SessionError> {
    let session_id = SessionId::parse(session_id)?;
    let identity = SessionIdentity::generate(&env, device_attributes);
    SessionController::new(env, config, session_id, identity, queue)
}

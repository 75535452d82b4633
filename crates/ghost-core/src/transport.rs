//! Connection lifecycle state machine.
//!
//! Drives a publish/subscribe channel through validation, subscription and
//! presence tracking, retries failed attempts, watches for silence after the
//! connection is up, and turns roster changes into peer events. Like every
//! state machine here it performs no I/O: methods take `now` and return
//! [`TransportAction`]s for the driver.
//!
//! # State Machine
//!
//! ```text
//! Connecting ─start─> Validating ─valid─> Subscribing ─subscribed─> Handshaking ─tracked─> Connected
//!                         │                    │                                             │  ↑
//!                 invalid │   budget exhausted │                                       stale │  │ resubscribed
//!                         ↓                    ↓                                             ↓  │
//!                         └──────────────────> Error <──────── budget exhausted ──────── Reconnecting
//!
//! close() from any state → Disconnected
//! ```
//!
//! # Retry Budget
//!
//! Each subscribe attempt must complete (subscribe and presence tracking)
//! within `subscribe_timeout`. A timeout or channel failure schedules the next
//! attempt after `retry_backoff[n]`. After `max_retries` retries the machine
//! moves to `Error` with [`TransportError::RetriesExhausted`]. With the
//! defaults the final failure lands 10.5 s after the first attempt:
//!
//! ```text
//! t=0    attempt 0 ─ 3s timeout ─ t=3.0  backoff 500ms
//! t=3.5  attempt 1 ─ 3s timeout ─ t=6.5  backoff 1000ms
//! t=7.5  attempt 2 ─ 3s timeout ─ t=10.5 error
//! ```

use std::{
    fmt,
    ops::{Add, Sub},
    time::Duration,
};

use crate::{error::TransportError, identity::SessionIdentity, timer::Timers};

/// Per-attempt subscribe timeout.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Delay before the first retry.
pub const DEFAULT_FIRST_BACKOFF: Duration = Duration::from_millis(500);

/// Delay before the second retry.
pub const DEFAULT_SECOND_BACKOFF: Duration = Duration::from_millis(1000);

/// Retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Interval between liveness checks once connected.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Silence after which a connected channel is considered stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// Transport status, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportStatus {
    /// Created, not started
    Connecting,
    /// Asking the registry whether the session exists
    Validating,
    /// Subscribing to the session channel
    Subscribing,
    /// Subscribed, registering presence
    Handshaking,
    /// Channel up and presence registered
    Connected,
    /// Re-subscribing after the channel went stale
    Reconnecting,
    /// Closed locally
    Disconnected,
    /// Failed permanently
    Error,
}

impl TransportStatus {
    /// Progress indicator for this status, 0-100.
    pub fn progress(self) -> u8 {
        match self {
            Self::Connecting | Self::Disconnected | Self::Error => 0,
            Self::Validating => 10,
            Self::Subscribing => 30,
            Self::Reconnecting => 50,
            Self::Handshaking => 70,
            Self::Connected => 100,
        }
    }

    /// Whether the machine can no longer change status on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

/// Read-only snapshot of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// Current status
    pub status: TransportStatus,
    /// Progress, 0-100
    pub progress: u8,
    /// Fatal error, once in `Error`
    pub error: Option<TransportError>,
}

/// Transport tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Timeout for one subscribe attempt
    pub subscribe_timeout: Duration,
    /// Delay before retry `n` (the last entry repeats if shorter than
    /// `max_retries`)
    pub retry_backoff: Vec<Duration>,
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Interval between liveness checks
    pub heartbeat_interval: Duration,
    /// Silence tolerated before reconnecting
    pub stale_after: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            retry_backoff: vec![DEFAULT_FIRST_BACKOFF, DEFAULT_SECOND_BACKOFF],
            max_retries: DEFAULT_MAX_RETRIES,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

impl TransportConfig {
    fn backoff(&self, retry: u32) -> Duration {
        let index = retry as usize;
        self.retry_backoff
            .get(index)
            .or_else(|| self.retry_backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Peer and connection events surfaced to the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// First connection completed
    Connected,
    /// Channel went stale, re-subscribing
    Reconnecting,
    /// Re-subscription completed
    Reconnected,
    /// Another participant is in the roster
    PeerPresent,
    /// The roster lost its only other participant
    PeerDeparted,
    /// Permanent failure
    Failed(TransportError),
    /// Closed locally
    Closed,
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAction {
    /// Ask the registry whether the session is valid
    ValidateSession,
    /// Subscribe to the session channel
    Subscribe {
        /// Attempt number, echoed back with the result
        attempt: u32,
    },
    /// Leave the channel
    Unsubscribe,
    /// Register our identity in the channel's presence roster
    TrackPresence {
        /// Attempt number, echoed back with the result
        attempt: u32,
    },
    /// Report an event upward
    Notify(TransportEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum TransportTimer {
    AttemptTimeout,
    Backoff,
    Heartbeat,
}

/// Connection state machine for one session.
///
/// Generic over `I` (instant type) to support real and virtual time.
pub struct Transport<I> {
    config: TransportConfig,
    self_identity: SessionIdentity,
    status: TransportStatus,
    error: Option<TransportError>,
    timers: Timers<TransportTimer, I>,
    /// Current attempt within the retry budget
    attempt: u32,
    /// True once the first connection completed
    ever_connected: bool,
    last_activity: Option<I>,
    peer_present: bool,
    heartbeat_suspended: bool,
}

impl<I> Transport<I>
where
    I: Copy + Ord + fmt::Debug + Sub<Output = Duration> + Add<Duration, Output = I>,
{
    /// New machine in `Connecting`.
    pub fn new(config: TransportConfig, self_identity: SessionIdentity) -> Self {
        Self {
            config,
            self_identity,
            status: TransportStatus::Connecting,
            error: None,
            timers: Timers::new(),
            attempt: 0,
            ever_connected: false,
            last_activity: None,
            peer_present: false,
            heartbeat_suspended: false,
        }
    }

    /// Current status.
    pub fn status(&self) -> TransportStatus {
        self.status
    }

    /// Snapshot for display.
    pub fn state(&self) -> ConnectionState {
        ConnectionState {
            status: self.status,
            progress: self.status.progress(),
            error: self.error.clone(),
        }
    }

    /// Our presence identity.
    pub fn self_identity(&self) -> &SessionIdentity {
        &self.self_identity
    }

    /// Whether another participant is currently in the roster.
    pub fn peer_present(&self) -> bool {
        self.peer_present
    }

    /// Current attempt number within the retry budget.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the result of `attempt` is still awaited. False once the
    /// attempt timed out, failed, was superseded or the machine stopped.
    pub fn attempt_in_flight(&self, attempt: u32) -> bool {
        attempt == self.attempt
            && self.timers.is_scheduled(TransportTimer::AttemptTimeout)
            && matches!(
                self.status,
                TransportStatus::Subscribing
                    | TransportStatus::Handshaking
                    | TransportStatus::Reconnecting
            )
    }

    /// Earliest pending deadline. The driver should call [`Self::tick`] then.
    pub fn next_deadline(&self) -> Option<I> {
        self.timers.next_deadline()
    }

    /// Begin connecting: validate the session first.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless in `Connecting`
    pub fn start(&mut self, now: I) -> Result<Vec<TransportAction>, TransportError> {
        self.expect_status(&[TransportStatus::Connecting], "start")?;

        self.status = TransportStatus::Validating;
        self.last_activity = Some(now);
        tracing::debug!("validating session");

        Ok(vec![TransportAction::ValidateSession])
    }

    /// Registry answered the validation request.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless in `Validating`
    pub fn handle_validation(
        &mut self,
        now: I,
        outcome: Result<(), String>,
    ) -> Result<Vec<TransportAction>, TransportError> {
        self.expect_status(&[TransportStatus::Validating], "handle_validation")?;

        if let Err(reason) = outcome {
            return Ok(self.fail(TransportError::ValidationFailed(reason)));
        }

        self.status = TransportStatus::Subscribing;
        self.attempt = 0;
        Ok(self.begin_attempt(now))
    }

    /// Channel confirmed subscription for `attempt`. Stale attempts are
    /// ignored.
    pub fn handle_subscribed(&mut self, now: I, attempt: u32) -> Vec<TransportAction> {
        if !self.attempt_in_flight(attempt) || self.status == TransportStatus::Handshaking {
            tracing::debug!(attempt, status = ?self.status, "ignoring stale subscribe result");
            return Vec::new();
        }

        if self.status == TransportStatus::Subscribing {
            self.status = TransportStatus::Handshaking;
        }
        self.last_activity = Some(now);

        vec![TransportAction::TrackPresence { attempt }]
    }

    /// Presence registered for `attempt`; the connection is up.
    pub fn handle_presence_tracked(&mut self, now: I, attempt: u32) -> Vec<TransportAction> {
        if !self.attempt_in_flight(attempt) {
            tracing::debug!(attempt, status = ?self.status, "ignoring stale presence result");
            return Vec::new();
        }

        let event =
            if self.ever_connected { TransportEvent::Reconnected } else { TransportEvent::Connected };

        self.status = TransportStatus::Connected;
        self.attempt = 0;
        self.ever_connected = true;
        self.last_activity = Some(now);
        self.timers.cancel(TransportTimer::AttemptTimeout);
        self.timers.schedule(TransportTimer::Heartbeat, now, self.config.heartbeat_interval);

        tracing::info!(?event, "transport connected");
        vec![TransportAction::Notify(event)]
    }

    /// Channel reported a failure for `attempt` (subscribe or track).
    pub fn handle_subscribe_failed(
        &mut self,
        now: I,
        attempt: u32,
        reason: String,
    ) -> Vec<TransportAction> {
        if !self.attempt_in_flight(attempt) {
            return Vec::new();
        }

        self.timers.cancel(TransportTimer::AttemptTimeout);
        self.attempt_failed(now, TransportError::ChannelFailure(reason))
    }

    /// The channel delivered something; the connection is alive.
    pub fn record_activity(&mut self, now: I) {
        self.last_activity = Some(now);
    }

    /// Process a presence roster (all identities currently on the channel).
    pub fn handle_presence(&mut self, now: I, roster: &[SessionIdentity]) -> Vec<TransportAction> {
        self.last_activity = Some(now);

        let others = roster.iter().filter(|id| **id != self.self_identity).count();

        match (self.peer_present, others > 0) {
            (false, true) => {
                self.peer_present = true;
                tracing::debug!(others, "peer present");
                vec![TransportAction::Notify(TransportEvent::PeerPresent)]
            },
            (true, false) => {
                self.peer_present = false;
                tracing::info!("peer departed");
                vec![TransportAction::Notify(TransportEvent::PeerDeparted)]
            },
            _ => Vec::new(),
        }
    }

    /// Stop stale-channel reconnects. Used while a departure-triggered
    /// termination is pending.
    pub fn suspend_heartbeat(&mut self) {
        self.heartbeat_suspended = true;
        self.timers.cancel(TransportTimer::Heartbeat);
    }

    /// Process expired deadlines.
    pub fn tick(&mut self, now: I) -> Vec<TransportAction> {
        let mut actions = Vec::new();

        for timer in self.timers.expire(now) {
            match timer {
                TransportTimer::AttemptTimeout => {
                    let err =
                        TransportError::SubscribeTimeout { timeout: self.config.subscribe_timeout };
                    actions.extend(self.attempt_failed(now, err));
                },
                TransportTimer::Backoff => {
                    self.attempt += 1;
                    actions.push(TransportAction::Unsubscribe);
                    actions.extend(self.begin_attempt(now));
                },
                TransportTimer::Heartbeat => actions.extend(self.heartbeat(now)),
            }
        }

        actions
    }

    /// Close the connection and cancel every deadline.
    ///
    /// Idempotent: closing a disconnected transport does nothing.
    pub fn close(&mut self) -> Vec<TransportAction> {
        self.timers.cancel_all();

        if self.status == TransportStatus::Disconnected {
            return Vec::new();
        }

        self.status = TransportStatus::Disconnected;
        tracing::info!("transport closed");

        vec![TransportAction::Unsubscribe, TransportAction::Notify(TransportEvent::Closed)]
    }

    fn heartbeat(&mut self, now: I) -> Vec<TransportAction> {
        if self.status != TransportStatus::Connected || self.heartbeat_suspended {
            return Vec::new();
        }

        let silent_for = self.last_activity.map_or(Duration::ZERO, |last| now - last);

        if silent_for <= self.config.stale_after {
            self.timers.schedule(TransportTimer::Heartbeat, now, self.config.heartbeat_interval);
            return Vec::new();
        }

        tracing::warn!(?silent_for, "channel stale, reconnecting");
        self.status = TransportStatus::Reconnecting;
        self.attempt = 0;

        let mut actions = vec![
            TransportAction::Notify(TransportEvent::Reconnecting),
            TransportAction::Unsubscribe,
        ];
        actions.extend(self.begin_attempt(now));
        actions
    }

    fn begin_attempt(&mut self, now: I) -> Vec<TransportAction> {
        tracing::debug!(attempt = self.attempt, "subscribe attempt");
        self.timers.schedule(TransportTimer::AttemptTimeout, now, self.config.subscribe_timeout);
        vec![TransportAction::Subscribe { attempt: self.attempt }]
    }

    fn attempt_failed(&mut self, now: I, err: TransportError) -> Vec<TransportAction> {
        debug_assert!(err.is_transient());

        if self.attempt < self.config.max_retries {
            let delay = self.config.backoff(self.attempt);
            tracing::warn!(attempt = self.attempt, ?delay, error = %err, "subscribe attempt failed, retrying");
            if self.status == TransportStatus::Handshaking {
                self.status = TransportStatus::Subscribing;
            }
            self.timers.schedule(TransportTimer::Backoff, now, delay);
            return Vec::new();
        }

        self.fail(TransportError::RetriesExhausted {
            attempts: self.attempt + 1,
            last: Box::new(err),
        })
    }

    fn fail(&mut self, err: TransportError) -> Vec<TransportAction> {
        tracing::warn!(error = %err, "transport failed");
        self.timers.cancel_all();
        self.status = TransportStatus::Error;
        self.error = Some(err.clone());

        vec![TransportAction::Unsubscribe, TransportAction::Notify(TransportEvent::Failed(err))]
    }

    fn expect_status(
        &self,
        allowed: &[TransportStatus],
        operation: &'static str,
    ) -> Result<(), TransportError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TransportError::InvalidState { status: self.status, operation })
        }
    }
}

impl<I> fmt::Debug for Transport<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("status", &self.status)
            .field("attempt", &self.attempt)
            .field("peer_present", &self.peer_present)
            .finish_non_exhaustive()
    }
}

//! Simulated participants.
//!
//! A [`Participant`] is one side of a session running the production
//! [`Runtime`] on a spawned task, wired to a [`SimRelay`] connection, a
//! shared [`MemoryRegistry`] and its own RAM queue and marker store.

use ghost_client::{
    MemoryMarkers, Runtime, SessionConfig, SessionController, SessionError, SessionHandle,
    SessionNotice, create_session, join_session,
};
use ghost_core::{MessageQueue, SessionId};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;

use crate::{
    SimEnv,
    registry::MemoryRegistry,
    relay::{MemberId, SimRelay},
};

/// One running side of a simulated session.
pub struct Participant {
    name: String,
    session_id: SessionId,
    member: MemberId,
    queue: MessageQueue,
    markers: MemoryMarkers,
    handle: SessionHandle,
    notices: mpsc::UnboundedReceiver<SessionNotice>,
    seen: Vec<SessionNotice>,
    task: JoinHandle<Result<(), SessionError>>,
}

impl Participant {
    /// Create a new session and start its runtime.
    ///
    /// # Errors
    ///
    /// - `Registry` if the reservation fails
    /// - `Crypto` if key generation fails
    pub async fn create(
        name: &str,
        env: SimEnv,
        config: SessionConfig,
        relay: &SimRelay,
        registry: &MemoryRegistry,
    ) -> Result<Self, SessionError> {
        let queue = MessageQueue::new();
        let controller = create_session(env.clone(), config, queue.clone(), registry, &[name]).await?;
        Ok(Self::launch(name, env, controller, queue, relay, registry))
    }

    /// Join an existing session and start its runtime.
    ///
    /// # Errors
    ///
    /// - `Identity` if `session_id` is malformed
    /// - `Crypto` if key generation fails
    pub fn join(
        name: &str,
        env: SimEnv,
        config: SessionConfig,
        relay: &SimRelay,
        registry: &MemoryRegistry,
        session_id: &SessionId,
    ) -> Result<Self, SessionError> {
        let queue = MessageQueue::new();
        let controller =
            join_session(env.clone(), config, queue.clone(), &session_id.to_string(), &[name])?;
        Ok(Self::launch(name, env, controller, queue, relay, registry))
    }

    fn launch(
        name: &str,
        env: SimEnv,
        controller: SessionController<SimEnv>,
        queue: MessageQueue,
        relay: &SimRelay,
        registry: &MemoryRegistry,
    ) -> Self {
        let session_id = controller.session_id().clone();
        let channel = relay.connect();
        let member = channel.member_id();
        let markers = MemoryMarkers::new();
        let (runtime, handle, notices) =
            Runtime::new(env, controller, channel, registry.clone(), markers.clone());

        let span = tracing::info_span!("participant", name);
        let task = tokio::spawn(runtime.run().instrument(span));

        Self {
            name: name.to_string(),
            session_id,
            member,
            queue,
            markers,
            handle,
            notices,
            seen: Vec::new(),
            task,
        }
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session this participant belongs to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Relay member id of this participant's connection.
    pub fn member(&self) -> MemberId {
        self.member
    }

    /// Handle for issuing commands.
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// The RAM queue the session writes into.
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// The local marker store.
    pub fn markers(&self) -> &MemoryMarkers {
        &self.markers
    }

    /// Every notice received so far, oldest first.
    pub fn seen(&self) -> &[SessionNotice] {
        &self.seen
    }

    /// Wait for the first notice matching `wanted` and return it. Notices
    /// before it are recorded in [`Self::seen`]. `None` once the runtime has
    /// stopped without producing one.
    pub async fn wait_for(
        &mut self,
        mut wanted: impl FnMut(&SessionNotice) -> bool,
    ) -> Option<SessionNotice> {
        while let Some(notice) = self.notices.recv().await {
            tracing::trace!(name = %self.name, ?notice, "notice");
            self.seen.push(notice.clone());
            if wanted(&notice) {
                return Some(notice);
            }
        }
        None
    }

    /// Stop the runtime task without terminating, as if the process died.
    pub async fn crash(self) {
        self.task.abort();
        let _ = self.task.await;
    }

    /// Wait for the runtime to exit and return every remaining notice.
    ///
    /// # Errors
    ///
    /// - `Task` if the runtime task panicked or was aborted
    /// - Whatever the runtime itself returned
    pub async fn finished(mut self) -> Result<Vec<SessionNotice>, SessionError> {
        self.task.await.map_err(|e| SessionError::Task(e.to_string()))??;
        while let Some(notice) = self.notices.recv().await {
            self.seen.push(notice);
        }
        Ok(self.seen)
    }
}

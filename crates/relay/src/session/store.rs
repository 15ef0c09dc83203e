//! Session store.
//!
//! Owns every live session record. Records are keyed by an unguessable id
//! and removed once closed; ids are never reused. Lifecycle changes of one
//! session serialize on that session's own lock, so there is no global lock
//! on the hot path.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::SystemTime;

use dashmap::DashMap;
use protocol::{CloseReason, Geometry, SessionKind};
use tokio::sync::{watch, Mutex, MutexGuard};
use uuid::Uuid;

use super::channel::RelayChannel;
use super::process::{InputSink, ProcessExit, ProcessHandle};
use super::{ConnectionId, SessionError, SessionId, SessionState};

/// Mutable lifecycle of a session, guarded by the record's lock.
#[derive(Debug)]
pub struct Lifecycle {
    /// Current state.
    pub state: SessionState,
    /// The session's process, once spawned.
    pub process: Option<Arc<ProcessHandle>>,
    /// Terminal geometry.
    pub geometry: Geometry,
    /// Why the session is closing.
    pub close_reason: Option<CloseReason>,
    /// Detail for the close notice.
    pub close_message: Option<String>,
    /// Exit status, once the process exited.
    pub exit: Option<ProcessExit>,
    /// Close requested while the process was still being spawned.
    pub deferred_close: Option<(CloseReason, Option<String>)>,
}

impl Lifecycle {
    /// Moves to `next`, enforcing the state machine.
    pub fn advance(&mut self, id: &str, next: SessionState) -> Result<SessionState, SessionError> {
        let previous = self.state;
        if !previous.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                id: id.to_string(),
                from: previous,
                to: next,
            });
        }
        self.state = next;
        tracing::debug!(session_id = %id, from = %previous, to = %next, "Session transition");
        Ok(previous)
    }
}

/// A live session.
pub struct SessionRecord {
    /// Unique session identifier.
    pub id: SessionId,
    /// User that owns the session.
    pub owner: String,
    /// Kind of process the session runs.
    pub kind: SessionKind,
    /// When the session was created.
    pub created_at: SystemTime,
    /// The connection that started the session, if one did.
    pub origin_connection: Option<ConnectionId>,
    /// Ordered input queue of the process.
    pub input: InputSink,
    /// Output fan-out.
    pub channel: RelayChannel,
    lifecycle: Mutex<Lifecycle>,
    launched: watch::Sender<bool>,
    pump_done: watch::Sender<bool>,
}

impl SessionRecord {
    /// Locks the lifecycle.
    pub async fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().await
    }

    /// Returns the current state.
    pub async fn state(&self) -> SessionState {
        self.lifecycle.lock().await.state
    }

    /// Moves to `next`, enforcing the state machine.
    pub async fn transition(&self, next: SessionState) -> Result<SessionState, SessionError> {
        self.lifecycle.lock().await.advance(&self.id, next)
    }

    /// Stores the spawned process and moves the session to Active.
    ///
    /// A session owns at most one process; a second one is an invariant
    /// violation. Returns the close that was requested while spawning, if
    /// any, for the caller to carry out now that there is a process to stop.
    pub async fn attach_process(
        &self,
        process: Arc<ProcessHandle>,
    ) -> Result<Option<(CloseReason, Option<String>)>, SessionError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.process.is_some() {
            return Err(SessionError::Invariant(format!(
                "session {} already owns a process",
                self.id
            )));
        }
        lifecycle.advance(&self.id, SessionState::Active)?;
        lifecycle.process = Some(process);
        Ok(lifecycle.deferred_close.take())
    }

    /// Returns the process handle, if spawned.
    pub async fn process(&self) -> Option<Arc<ProcessHandle>> {
        self.lifecycle.lock().await.process.clone()
    }

    /// Marks the launch as finished, successful or not.
    pub fn mark_launched(&self) {
        self.launched.send_replace(true);
    }

    /// Waits until the launch finished.
    pub async fn wait_launched(&self) {
        let mut rx = self.launched.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Marks the output pump as finished.
    pub fn mark_pump_done(&self) {
        self.pump_done.send_replace(true);
    }

    /// Waits until all output was relayed.
    pub async fn wait_pump_done(&self) {
        let mut rx = self.pump_done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Parameters of a new session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub owner: String,
    pub kind: SessionKind,
    pub geometry: Geometry,
    pub origin_connection: Option<ConnectionId>,
    pub input: InputSink,
}

/// Session count limits.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_sessions: usize,
    pub max_sessions_per_owner: usize,
    pub member_queue_capacity: usize,
    pub pending_buffer_bytes: usize,
}

/// Thread-safe store of live sessions.
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<SessionRecord>>,
    limits: StoreLimits,
    /// Serializes the limit check with the insert.
    create_lock: StdMutex<()>,
}

impl SessionStore {
    /// Creates an empty store.
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            limits,
            create_lock: StdMutex::new(()),
        }
    }

    /// Registers a new session in the Starting state.
    pub fn create(&self, new: NewSession) -> Result<Arc<SessionRecord>, SessionError> {
        let _guard = self
            .create_lock
            .lock()
            .map_err(|_| SessionError::Invariant("session store lock poisoned".to_string()))?;

        if self.sessions.len() >= self.limits.max_sessions {
            return Err(SessionError::LimitExceeded(format!(
                "at most {} sessions may run at once",
                self.limits.max_sessions
            )));
        }
        if self.count_for_owner(&new.owner) >= self.limits.max_sessions_per_owner {
            return Err(SessionError::LimitExceeded(format!(
                "at most {} sessions per user",
                self.limits.max_sessions_per_owner
            )));
        }

        let mut id = Uuid::new_v4().simple().to_string();
        while self.sessions.contains_key(&id) {
            id = Uuid::new_v4().simple().to_string();
        }

        let record = Arc::new(SessionRecord {
            id: id.clone(),
            owner: new.owner,
            kind: new.kind,
            created_at: SystemTime::now(),
            origin_connection: new.origin_connection,
            input: new.input,
            channel: RelayChannel::new(
                id.clone(),
                new.kind,
                self.limits.member_queue_capacity,
                self.limits.pending_buffer_bytes,
            ),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Starting,
                process: None,
                geometry: new.geometry,
                close_reason: None,
                close_message: None,
                exit: None,
                deferred_close: None,
            }),
            launched: watch::channel(false).0,
            pump_done: watch::channel(false).0,
        });

        self.sessions.insert(id, Arc::clone(&record));
        Ok(record)
    }

    /// Looks up a session.
    pub fn get(&self, id: &str) -> Result<Arc<SessionRecord>, SessionError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Moves a session to `next`, enforcing the state machine.
    pub async fn transition(
        &self,
        id: &str,
        next: SessionState,
    ) -> Result<SessionState, SessionError> {
        self.get(id)?.transition(next).await
    }

    /// Removes a session record.
    pub fn remove(&self, id: &str) -> Option<Arc<SessionRecord>> {
        self.sessions.remove(id).map(|(_, record)| record)
    }

    /// Returns every live record.
    pub fn list(&self) -> Vec<Arc<SessionRecord>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Returns the number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Returns the number of live sessions owned by `owner`.
    pub fn count_for_owner(&self, owner: &str) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().owner == owner)
            .count()
    }
}

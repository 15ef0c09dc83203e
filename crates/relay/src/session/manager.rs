//! Session manager.
//!
//! Ties the store, the process adapter and the relay channels together and
//! drives every session through its lifecycle:
//!
//! ```text
//! start ──► Starting ──spawn ok──► Active ──exit / owner left / idle──► Draining ──► Closed
//!              │
//!              └──────────────spawn failed──────────────────────────────────────────► Closed
//! ```
//!
//! Closing is idempotent: the first trigger moves the session to Draining and
//! starts a drain task that terminates the process, waits for trailing
//! output, then notifies every member once and removes the record. A close
//! requested while the process is still being spawned is recorded and
//! carried out as soon as the session turns Active.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use protocol::messages::{SessionClosed, StartSession};
use protocol::{CloseReason, Geometry, SessionKind};
use tokio::sync::{mpsc, oneshot};

use super::channel::Subscriber;
use super::process::{self, input_channel, InputSource, OutputChunk, ProcessExit, ProcessSpec};
use super::store::{NewSession, SessionRecord, SessionStore, StoreLimits};
use super::{SessionError, SessionId, SessionState};
use crate::auth::Identity;
use crate::config::{RelayConfig, SessionConfig};

/// Interval at which shutdown checks for remaining sessions.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Trait for session management operations.
///
/// This trait defines the interface the message router drives.
/// Implementations must be thread-safe and suitable for concurrent access.
#[allow(async_fn_in_trait)]
pub trait SessionManager: Send + Sync {
    /// Creates a session for `identity` and joins the requesting connection.
    ///
    /// Returns as soon as the session is registered; the process is spawned
    /// in the background and a spawn failure is reported through
    /// `session_closed`.
    async fn start(
        &self,
        identity: &Identity,
        request: StartSession,
        subscriber: Subscriber,
    ) -> Result<SessionId, SessionError>;

    /// Creates a session that no connection is attached to yet.
    ///
    /// Used for upload-triggered executions: the caller hands the session id
    /// to the client, output is held in the pending buffer until the first
    /// join, and any connection of the owner may join.
    async fn submit(
        &self,
        identity: &Identity,
        request: StartSession,
    ) -> Result<SessionId, SessionError>;

    /// Joins a connection to an existing session.
    async fn join(
        &self,
        identity: &Identity,
        session_id: &str,
        subscriber: Subscriber,
    ) -> Result<(), SessionError>;

    /// Removes a connection from a session. Idempotent; returns whether the
    /// connection was a member.
    async fn leave(&self, session_id: &str, connection_id: &str) -> Result<bool, SessionError>;

    /// Forwards input from a member to the session's process.
    async fn forward_input(
        &self,
        identity: &Identity,
        session_id: &str,
        connection_id: &str,
        bytes: Vec<u8>,
    ) -> Result<(), SessionError>;

    /// Resizes the session's terminal.
    async fn resize(
        &self,
        identity: &Identity,
        session_id: &str,
        connection_id: &str,
        geometry: Geometry,
    ) -> Result<(), SessionError>;

    /// Begins closing a session. Idempotent.
    async fn close(
        &self,
        session_id: &str,
        reason: CloseReason,
        message: Option<String>,
    ) -> Result<(), SessionError>;

    /// Lists all live sessions.
    async fn list(&self) -> Vec<SessionInfo>;

    /// Returns whether the session is still live.
    fn contains(&self, session_id: &str) -> bool;

    /// Returns the number of live sessions.
    fn count(&self) -> usize;
}

/// Snapshot of a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Owning user.
    pub owner: String,
    /// Kind of process.
    pub kind: SessionKind,
    /// Lifecycle state.
    pub state: SessionState,
    /// Number of attached connections.
    pub members: usize,
    /// Process ID, once spawned.
    pub pid: Option<u32>,
    /// Creation time.
    pub created_at: SystemTime,
}

/// What a start request resolved to.
#[derive(Debug)]
struct LaunchPlan {
    spec: ProcessSpec,
    geometry: Geometry,
    /// Script that must exist before spawning.
    script: Option<PathBuf>,
    workspace: PathBuf,
}

struct ManagerInner {
    store: SessionStore,
    session: SessionConfig,
    relay: RelayConfig,
}

/// Session manager backed by a [`SessionStore`].
#[derive(Clone)]
pub struct SessionManagerImpl {
    inner: Arc<ManagerInner>,
}

impl SessionManagerImpl {
    /// Creates a session manager.
    pub fn new(session: SessionConfig, relay: RelayConfig) -> Self {
        let store = SessionStore::new(StoreLimits {
            max_sessions: session.max_sessions,
            max_sessions_per_owner: session.max_sessions_per_owner,
            member_queue_capacity: relay.member_queue_capacity,
            pending_buffer_bytes: relay.pending_buffer_bytes,
        });
        Self {
            inner: Arc::new(ManagerInner {
                store,
                session,
                relay,
            }),
        }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    /// Closes sessions that had no members for longer than the idle timeout.
    ///
    /// Returns the number of sessions closed.
    pub async fn reap_idle(&self) -> usize {
        let timeout = self.inner.relay.idle_timeout();
        let mut reaped = 0;

        for record in self.inner.store.list() {
            if record.state().await.is_terminating() {
                continue;
            }
            match record.channel.idle_for().await {
                Some(idle) if idle >= timeout => {
                    tracing::info!(
                        session_id = %record.id,
                        owner = %record.owner,
                        idle_secs = idle.as_secs(),
                        "Closing idle session"
                    );
                    if self
                        .inner
                        .close_session(&record, CloseReason::IdleTimeout, None)
                        .await
                    {
                        reaped += 1;
                    }
                }
                _ => {}
            }
        }

        reaped
    }

    /// Closes every session and waits for them to finish draining.
    ///
    /// Returns the number of sessions still present when the wait gave up.
    pub async fn shutdown(&self, message: &str) -> usize {
        let (closing, remaining) = self
            .close_where(|_| true, CloseReason::Error, Some(message.to_string()))
            .await;
        if closing > 0 {
            tracing::info!(sessions = closing, "Closed all sessions");
        }
        if remaining > 0 {
            tracing::warn!(remaining, "Sessions still draining at shutdown");
        }
        remaining
    }

    /// Closes every session of `owner` and waits for them to be gone.
    ///
    /// Used when an identity logs out. Returns the number of sessions that
    /// were closed.
    pub async fn close_owner(
        &self,
        owner: &str,
        reason: CloseReason,
        message: Option<String>,
    ) -> usize {
        let (closing, remaining) = self
            .close_where(|record| record.owner == owner, reason, message)
            .await;
        tracing::info!(owner = %owner, sessions = closing, "Closed sessions of owner");
        if remaining > 0 {
            tracing::warn!(owner = %owner, remaining, "Owner sessions still draining");
        }
        closing
    }

    /// Closes the sessions `filter` selects and waits until they are removed
    /// or the drain deadline passes. Returns how many were selected and how
    /// many are still present.
    async fn close_where<F>(
        &self,
        filter: F,
        reason: CloseReason,
        message: Option<String>,
    ) -> (usize, usize)
    where
        F: Fn(&SessionRecord) -> bool,
    {
        let records: Vec<_> = self
            .inner
            .store
            .list()
            .into_iter()
            .filter(|record| filter(record))
            .collect();
        if records.is_empty() {
            return (0, 0);
        }

        for record in &records {
            self.inner
                .close_session(record, reason, message.clone())
                .await;
        }

        let live = || {
            records
                .iter()
                .filter(|record| self.inner.store.get(&record.id).is_ok())
                .count()
        };
        let deadline = tokio::time::Instant::now()
            + self.inner.relay.termination_grace()
            + self.inner.relay.drain_grace()
            + Duration::from_secs(3);
        while live() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        (records.len(), live())
    }

    async fn create(
        &self,
        identity: &Identity,
        request: StartSession,
        subscriber: Option<Subscriber>,
    ) -> Result<SessionId, SessionError> {
        let plan = self.inner.plan(&identity.user_id, &request)?;
        let (input, source) = input_channel(self.inner.relay.input_queue_capacity);

        let record = self.inner.store.create(NewSession {
            owner: identity.user_id.clone(),
            kind: request.kind,
            geometry: plan.geometry,
            origin_connection: subscriber.as_ref().map(|s| s.connection_id.clone()),
            input,
        })?;

        tracing::info!(
            session_id = %record.id,
            owner = %record.owner,
            kind = %record.kind,
            cols = plan.geometry.cols,
            rows = plan.geometry.rows,
            "Created session"
        );

        if let Some(subscriber) = subscriber {
            record.channel.join(subscriber).await?;
        }

        let id = record.id.clone();
        tokio::spawn(Arc::clone(&self.inner).launch(record, plan, source));
        Ok(id)
    }
}

impl SessionManager for SessionManagerImpl {
    async fn start(
        &self,
        identity: &Identity,
        request: StartSession,
        subscriber: Subscriber,
    ) -> Result<SessionId, SessionError> {
        self.create(identity, request, Some(subscriber)).await
    }

    async fn submit(
        &self,
        identity: &Identity,
        request: StartSession,
    ) -> Result<SessionId, SessionError> {
        self.create(identity, request, None).await
    }

    async fn join(
        &self,
        identity: &Identity,
        session_id: &str,
        subscriber: Subscriber,
    ) -> Result<(), SessionError> {
        let record = self.inner.store.get(session_id)?;
        authorize(&record, identity, &subscriber.connection_id)?;
        record.channel.join(subscriber).await
    }

    async fn leave(&self, session_id: &str, connection_id: &str) -> Result<bool, SessionError> {
        let Ok(record) = self.inner.store.get(session_id) else {
            return Ok(false);
        };

        let left = record.channel.leave(connection_id).await;
        if left {
            tracing::debug!(
                session_id = %session_id,
                connection_id = %connection_id,
                "Connection left session"
            );
            self.inner.after_leave(&record).await;
        }
        Ok(left)
    }

    async fn forward_input(
        &self,
        identity: &Identity,
        session_id: &str,
        connection_id: &str,
        bytes: Vec<u8>,
    ) -> Result<(), SessionError> {
        let record = self.inner.store.get(session_id)?;
        require_member(&record, identity, connection_id).await?;
        record.input.write(bytes);
        Ok(())
    }

    async fn resize(
        &self,
        identity: &Identity,
        session_id: &str,
        connection_id: &str,
        geometry: Geometry,
    ) -> Result<(), SessionError> {
        if !geometry.is_valid() {
            return Err(SessionError::InvalidRequest(format!(
                "invalid geometry {}x{}",
                geometry.cols, geometry.rows
            )));
        }

        let record = self.inner.store.get(session_id)?;
        require_member(&record, identity, connection_id).await?;

        let process = {
            let mut lifecycle = record.lifecycle().await;
            lifecycle.geometry = geometry;
            lifecycle.process.clone()
        };

        if let Some(process) = process {
            if let Err(e) = process.resize(geometry) {
                tracing::debug!(session_id = %session_id, error = %e, "Resize failed");
            }
        }
        Ok(())
    }

    async fn close(
        &self,
        session_id: &str,
        reason: CloseReason,
        message: Option<String>,
    ) -> Result<(), SessionError> {
        if let Ok(record) = self.inner.store.get(session_id) {
            self.inner.close_session(&record, reason, message).await;
        }
        Ok(())
    }

    async fn list(&self) -> Vec<SessionInfo> {
        let mut sessions = Vec::new();
        for record in self.inner.store.list() {
            let (state, pid) = {
                let lifecycle = record.lifecycle().await;
                (
                    lifecycle.state,
                    lifecycle.process.as_ref().and_then(|p| p.pid()),
                )
            };
            sessions.push(SessionInfo {
                id: record.id.clone(),
                owner: record.owner.clone(),
                kind: record.kind,
                state,
                members: record.channel.member_count().await,
                pid,
                created_at: record.created_at,
            });
        }
        sessions
    }

    fn count(&self) -> usize {
        self.inner.store.count()
    }

    fn contains(&self, session_id: &str) -> bool {
        self.inner.store.get(session_id).is_ok()
    }
}

/// Checks that a connection of `identity` may attach to `record`.
///
/// Only the owner may attach. An execution started by a connection is
/// further restricted to that connection.
fn authorize(
    record: &SessionRecord,
    identity: &Identity,
    connection_id: &str,
) -> Result<(), SessionError> {
    if record.owner != identity.user_id {
        tracing::warn!(
            session_id = %record.id,
            owner = %record.owner,
            user = %identity.user_id,
            "Rejected access to another user's session"
        );
        return Err(SessionError::Forbidden(record.id.clone()));
    }

    if record.kind == SessionKind::ExecutionLog {
        if let Some(ref origin) = record.origin_connection {
            if origin != connection_id {
                return Err(SessionError::Forbidden(record.id.clone()));
            }
        }
    }

    Ok(())
}

async fn require_member(
    record: &SessionRecord,
    identity: &Identity,
    connection_id: &str,
) -> Result<(), SessionError> {
    authorize(record, identity, connection_id)?;
    if !record.channel.is_member(connection_id).await {
        return Err(SessionError::Forbidden(record.id.clone()));
    }
    Ok(())
}

/// Resolves a script path inside a workspace, rejecting anything that could
/// escape it.
fn resolve_script(workspace: &Path, script: &str) -> Result<PathBuf, SessionError> {
    let relative = Path::new(script);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if script.trim().is_empty() || escapes {
        return Err(SessionError::InvalidRequest(format!(
            "script path must be relative to the workspace: {}",
            script
        )));
    }
    Ok(workspace.join(relative))
}

/// Prefixes a command with the configured launcher, if any.
fn wrap_in_launcher(
    launcher: &[String],
    owner: &str,
    workspace: &Path,
    program: String,
    args: Vec<String>,
) -> (String, Vec<String>) {
    let Some((first, rest)) = launcher.split_first() else {
        return (program, args);
    };

    let workspace = workspace.to_string_lossy();
    let expand = |part: &String| {
        part.replace("{owner}", owner)
            .replace("{workspace}", &workspace)
    };

    let mut wrapped: Vec<String> = rest.iter().map(expand).collect();
    wrapped.push(program);
    wrapped.extend(args);
    (expand(first), wrapped)
}

impl ManagerInner {
    /// Validates a start request and resolves what to run.
    fn plan(&self, owner: &str, request: &StartSession) -> Result<LaunchPlan, SessionError> {
        let geometry = request.geometry.unwrap_or_else(|| {
            Geometry::new(self.session.default_cols, self.session.default_rows)
        });
        if !geometry.is_valid() {
            return Err(SessionError::InvalidRequest(format!(
                "invalid geometry {}x{}",
                geometry.cols, geometry.rows
            )));
        }

        let workspace = self.session.workspace_root.join(owner);
        let mut env = self.session.env.clone();
        let mut script_path = None;

        let (program, args) = match request.kind {
            SessionKind::InteractiveShell => {
                if request.command.is_some() || request.script.is_some() {
                    return Err(SessionError::InvalidRequest(
                        "command and script apply to execution_log sessions only".to_string(),
                    ));
                }
                (
                    self.session.default_shell.clone(),
                    self.session.shell_args.clone(),
                )
            }
            SessionKind::ExecutionLog => {
                env.push(("PYTHONUNBUFFERED".to_string(), "1".to_string()));
                match (&request.command, &request.script) {
                    (Some(command), None) if !command.trim().is_empty() => (
                        "/bin/sh".to_string(),
                        vec!["-c".to_string(), command.clone()],
                    ),
                    (None, Some(script)) => {
                        script_path = Some(resolve_script(&workspace, script)?);
                        // Relative to the working directory, so a launcher that
                        // mounts the workspace elsewhere still finds it.
                        (self.session.interpreter.clone(), vec![script.clone()])
                    }
                    _ => {
                        return Err(SessionError::InvalidRequest(
                            "execution_log sessions need exactly one of command or script"
                                .to_string(),
                        ))
                    }
                }
            }
        };

        let launcher = match request.kind {
            SessionKind::InteractiveShell => &self.session.shell_launcher,
            SessionKind::ExecutionLog => &self.session.exec_launcher,
        };
        let (program, args) = wrap_in_launcher(launcher, owner, &workspace, program, args);

        Ok(LaunchPlan {
            spec: ProcessSpec {
                kind: request.kind,
                program,
                args,
                cwd: Some(workspace.clone()),
                env,
                limits: self.session.limits,
            },
            geometry,
            script: script_path,
            workspace,
        })
    }

    /// Spawns the process of a Starting session and wires up its tasks.
    async fn launch(
        self: Arc<Self>,
        record: Arc<SessionRecord>,
        plan: LaunchPlan,
        source: InputSource,
    ) {
        let spawned = match spawn_plan(&plan, source).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.fail_launch(&record, e).await;
                return;
            }
        };

        let handle = Arc::new(spawned.handle);
        let deferred = match record.attach_process(Arc::clone(&handle)).await {
            Ok(deferred) => deferred,
            Err(e) => {
                // Abort only this session; the stray process must not outlive it.
                tracing::error!(session_id = %record.id, error = %e, "Session invariant violated");
                handle.terminate(self.relay.termination_grace()).await;
                self.fail_launch(&record, e).await;
                return;
            }
        };
        tracing::info!(
            session_id = %record.id,
            pid = ?handle.pid(),
            program = %plan.spec.program,
            "Session active"
        );

        let current = record.lifecycle().await.geometry;
        if current != plan.geometry {
            if let Err(e) = handle.resize(current) {
                tracing::debug!(session_id = %record.id, error = %e, "Deferred resize failed");
            }
        }

        tokio::spawn(Arc::clone(&self).pump(Arc::clone(&record), spawned.output));
        tokio::spawn(Arc::clone(&self).watch_exit(Arc::clone(&record), spawned.exit));
        record.mark_launched();

        if let Some((reason, message)) = deferred {
            tracing::debug!(
                session_id = %record.id,
                reason = %reason,
                "Closing session that was closed while starting"
            );
            self.close_session(&record, reason, message).await;
        }
    }

    async fn fail_launch(&self, record: &Arc<SessionRecord>, error: SessionError) {
        let message = error.to_string();
        tracing::warn!(session_id = %record.id, error = %message, "Failed to start session");

        let closed_now = {
            let mut lifecycle = record.lifecycle().await;
            if lifecycle.state == SessionState::Starting {
                lifecycle.advance(&record.id, SessionState::Closed).is_ok()
            } else {
                // A close is already draining the session and will finish it.
                false
            }
        };

        if closed_now {
            record
                .channel
                .close(SessionClosed {
                    session_id: record.id.clone(),
                    reason: CloseReason::Error,
                    exit_code: None,
                    signal: None,
                    message: Some(message),
                })
                .await;
            self.store.remove(&record.id);
        }

        record.mark_pump_done();
        record.mark_launched();
    }

    /// Relays process output into the channel until the process closes it.
    async fn pump(self: Arc<Self>, record: Arc<SessionRecord>, mut output: mpsc::Receiver<OutputChunk>) {
        while let Some(chunk) = output.recv().await {
            let departed = record.channel.broadcast(chunk).await;
            if !departed.is_empty() {
                self.after_leave(&record).await;
            }
        }
        tracing::debug!(session_id = %record.id, "Output ended");
        record.mark_pump_done();
    }

    async fn watch_exit(
        self: Arc<Self>,
        record: Arc<SessionRecord>,
        exit: oneshot::Receiver<ProcessExit>,
    ) {
        let status = exit.await.unwrap_or_default();
        tracing::info!(
            session_id = %record.id,
            code = ?status.code,
            signal = ?status.signal,
            "Session process exited"
        );
        record.lifecycle().await.exit = Some(status);
        self.close_session(&record, CloseReason::Exited, None).await;
    }

    /// A shell whose owner has no connection left starts draining.
    async fn after_leave(self: &Arc<Self>, record: &Arc<SessionRecord>) {
        if record.kind == SessionKind::InteractiveShell
            && !record.channel.has_member_for(&record.owner).await
        {
            self.close_session(record, CloseReason::OwnerDisconnected, None)
                .await;
        }
    }

    /// Moves a session to Draining and starts its drain task.
    ///
    /// A session that is still starting only records the request; the
    /// launch carries it out once the process is attached. Returns false if
    /// the session was already closing.
    async fn close_session(
        self: &Arc<Self>,
        record: &Arc<SessionRecord>,
        reason: CloseReason,
        message: Option<String>,
    ) -> bool {
        {
            let mut lifecycle = record.lifecycle().await;
            if lifecycle.state.is_terminating() {
                return false;
            }
            if lifecycle.state == SessionState::Starting {
                if lifecycle.deferred_close.is_some() {
                    return false;
                }
                tracing::debug!(session_id = %record.id, reason = %reason, "Close deferred until started");
                lifecycle.deferred_close = Some((reason, message));
                return true;
            }
            if let Err(e) = lifecycle.advance(&record.id, SessionState::Draining) {
                tracing::error!(session_id = %record.id, error = %e, "Cannot drain session");
                return false;
            }
            lifecycle.close_reason = Some(reason);
            lifecycle.close_message = message;
        }

        tracing::info!(session_id = %record.id, reason = %reason, "Session draining");
        tokio::spawn(Arc::clone(self).drain(Arc::clone(record)));
        true
    }

    async fn drain(self: Arc<Self>, record: Arc<SessionRecord>) {
        record.wait_launched().await;

        if let Some(process) = record.process().await {
            let exit = process.terminate(self.relay.termination_grace()).await;
            record.lifecycle().await.exit.get_or_insert(exit);
        }

        if tokio::time::timeout(self.relay.drain_grace(), record.wait_pump_done())
            .await
            .is_err()
        {
            tracing::debug!(session_id = %record.id, "Trailing output still open, closing anyway");
        }

        // A run nobody attached to yet keeps its output for the first viewer.
        let reason = record.lifecycle().await.close_reason;
        if reason == Some(CloseReason::Exited) && !record.channel.ever_joined() {
            let _ = tokio::time::timeout(
                self.relay.idle_timeout(),
                record.channel.wait_first_join(),
            )
            .await;
        }

        self.finalize(&record).await;
    }

    async fn finalize(&self, record: &SessionRecord) {
        let closed = {
            let mut lifecycle = record.lifecycle().await;
            if let Err(e) = lifecycle.advance(&record.id, SessionState::Closed) {
                tracing::error!(session_id = %record.id, error = %e, "Unexpected state at close");
                lifecycle.state = SessionState::Closed;
            }
            let exit = lifecycle
                .exit
                .or_else(|| lifecycle.process.as_ref().and_then(|p| p.exit_status()));
            SessionClosed {
                session_id: record.id.clone(),
                reason: lifecycle.close_reason.unwrap_or(CloseReason::Error),
                exit_code: exit.and_then(|e| e.code),
                signal: exit.and_then(|e| e.signal),
                message: lifecycle.close_message.clone(),
            }
        };

        let reason = closed.reason;
        let notified = record.channel.close(closed).await;
        self.store.remove(&record.id);

        tracing::info!(
            session_id = %record.id,
            owner = %record.owner,
            reason = %reason,
            notified,
            "Session closed"
        );
    }
}

async fn spawn_plan(
    plan: &LaunchPlan,
    source: InputSource,
) -> Result<process::SpawnedProcess, SessionError> {
    tokio::fs::create_dir_all(&plan.workspace)
        .await
        .map_err(|e| {
            SessionError::SpawnFailed(format!(
                "cannot create workspace {}: {}",
                plan.workspace.display(),
                e
            ))
        })?;

    if let Some(ref script) = plan.script {
        let is_file = tokio::fs::metadata(script)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            let name = script.strip_prefix(&plan.workspace).unwrap_or(script);
            return Err(SessionError::SpawnFailed(format!(
                "script not found: {}",
                name.display()
            )));
        }
    }

    process::spawn(&plan.spec, plan.geometry, source)
}

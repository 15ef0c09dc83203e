//! Message router for dispatching client requests to the session manager.
//!
//! This module provides the `MessageRouter` struct that receives decoded
//! client messages for one connection and routes them to the session
//! manager. Replies that belong to a session (`session_assigned`, `output`,
//! `session_closed`) travel through the session's relay channel; the router
//! itself only produces `error` messages.
//!
//! Every message is checked against the Auth Guard before it is routed, so a
//! token that expires or is revoked mid-connection stops working at once.

use std::collections::HashSet;
use std::sync::Arc;

use protocol::messages::{
    ErrorMessage, JoinSession, LeaveSession, ResizeSession, SessionInput, StartSession,
};
use protocol::{ClientMessage, ErrorCode, Geometry, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, AuthGuard, Identity};
use crate::session::{ConnectionId, SessionError, SessionId, SessionManager, Subscriber};

/// Result type for router operations.
pub type RouterResult = Result<Option<ServerMessage>, RouterError>;

/// Errors that can occur during message routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session-related error.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// The caller's identity is no longer valid.
    #[error("{0}")]
    Auth(#[from] AuthError),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RouterError {
    /// Convert the error to a protocol ErrorMessage.
    pub fn to_error_message(&self, session_id: Option<String>) -> ErrorMessage {
        let (code, recoverable) = match self {
            RouterError::Session(e) => match e {
                SessionError::NotFound(_) | SessionError::Closed(_) => {
                    (ErrorCode::NotFound, false)
                }
                SessionError::Forbidden(_) => (ErrorCode::Forbidden, false),
                SessionError::SpawnFailed(_) => (ErrorCode::SpawnFailed, true),
                SessionError::LimitExceeded(_) => (ErrorCode::LimitExceeded, true),
                SessionError::InvalidRequest(_) => (ErrorCode::InvalidRequest, false),
                SessionError::InvalidTransition { .. }
                | SessionError::Invariant(_)
                | SessionError::Io(_) => (ErrorCode::InternalError, true),
            },
            RouterError::Auth(AuthError::Unauthenticated) => (ErrorCode::Unauthenticated, false),
            RouterError::Auth(AuthError::Expired) => (ErrorCode::Expired, false),
            RouterError::InvalidRequest(_) => (ErrorCode::InvalidRequest, false),
        };

        ErrorMessage {
            code,
            message: self.to_string(),
            session_id,
            recoverable,
        }
    }

    /// Returns true if the connection must be closed after reporting the error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RouterError::Auth(_))
    }
}

/// Per-connection state the router reads and updates.
#[derive(Debug)]
pub struct ConnectionContext {
    /// Identity resolved at handshake.
    pub identity: Identity,
    /// Unique connection identifier.
    pub connection_id: ConnectionId,
    /// Queue drained by the connection's writer task.
    pub outbound: mpsc::Sender<ServerMessage>,
    joined: HashSet<SessionId>,
}

impl ConnectionContext {
    /// Creates the context for a freshly authenticated connection.
    pub fn new(
        identity: Identity,
        connection_id: impl Into<ConnectionId>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            identity,
            connection_id: connection_id.into(),
            outbound,
            joined: HashSet::new(),
        }
    }

    /// Sessions this connection joined and has not left.
    pub fn joined(&self) -> impl Iterator<Item = &SessionId> {
        self.joined.iter()
    }

    fn subscriber(&self) -> Subscriber {
        Subscriber {
            connection_id: self.connection_id.clone(),
            user_id: self.identity.user_id.clone(),
            outbound: self.outbound.clone(),
        }
    }
}

/// Returns the session a client message refers to, if any.
pub fn target_session(message: &ClientMessage) -> Option<&str> {
    match message {
        ClientMessage::Start(_) => None,
        ClientMessage::Join(m) => Some(&m.session_id),
        ClientMessage::Leave(m) => Some(&m.session_id),
        ClientMessage::Input(m) => Some(&m.session_id),
        ClientMessage::Resize(m) => Some(&m.session_id),
    }
}

/// Message router that dispatches client requests to the session manager.
pub struct MessageRouter<S: SessionManager> {
    /// Session manager owning every live session.
    session_manager: Arc<S>,
    /// Re-checks the caller before each operation.
    guard: Arc<AuthGuard>,
}

impl<S: SessionManager> MessageRouter<S> {
    /// Create a new message router.
    pub fn new(session_manager: Arc<S>, guard: Arc<AuthGuard>) -> Self {
        Self {
            session_manager,
            guard,
        }
    }

    /// Returns the session manager.
    pub fn session_manager(&self) -> &Arc<S> {
        &self.session_manager
    }

    /// Route a message to the appropriate handler.
    ///
    /// Returns `Ok(Some(response))` if a response should be sent back,
    /// `Ok(None)` if no response is needed, or `Err(error)` if routing failed.
    pub async fn route(&self, message: ClientMessage, ctx: &mut ConnectionContext) -> RouterResult {
        debug!(
            connection_id = %ctx.connection_id,
            session_id = ?target_session(&message),
            "Routing message"
        );

        if let Err(e) = self.guard.revalidate(&ctx.identity) {
            warn!(
                connection_id = %ctx.connection_id,
                user = %ctx.identity.user_id,
                error = %e,
                "Identity no longer valid, rejecting message"
            );
            return Err(e.into());
        }

        match message {
            ClientMessage::Start(req) => self.handle_start(req, ctx).await,
            ClientMessage::Join(req) => self.handle_join(req, ctx).await,
            ClientMessage::Leave(req) => self.handle_leave(req, ctx).await,
            ClientMessage::Input(req) => self.handle_input(req, ctx).await,
            ClientMessage::Resize(req) => self.handle_resize(req, ctx).await,
        }
    }

    /// Starts an execution on behalf of a token holder without a connection.
    ///
    /// This is the entry point for upload-triggered runs: the token is
    /// verified like a handshake's, then the session is created detached and
    /// its output waits for the first join.
    pub async fn submit(&self, token: &str, request: StartSession) -> Result<SessionId, RouterError> {
        let identity = self.guard.verify(token).inspect_err(|e| {
            warn!(error = %e, "Rejected execution submit");
        })?;
        info!(owner = %identity.user_id, kind = %request.kind, "Submitting execution");
        Ok(self.session_manager.submit(&identity, request).await?)
    }

    /// Leaves every session the connection is still a member of.
    ///
    /// Called once the transport is gone, in place of the `leave` messages
    /// the client never sent.
    pub async fn disconnect(&self, ctx: &mut ConnectionContext) {
        for session_id in ctx.joined.drain() {
            match self
                .session_manager
                .leave(&session_id, &ctx.connection_id)
                .await
            {
                Ok(true) => debug!(
                    session_id = %session_id,
                    connection_id = %ctx.connection_id,
                    "Left session on disconnect"
                ),
                Ok(false) => {}
                Err(e) => warn!(
                    session_id = %session_id,
                    connection_id = %ctx.connection_id,
                    error = %e,
                    "Failed to leave session on disconnect"
                ),
            }
        }
    }

    // =========================================================================
    // Session Handlers
    // =========================================================================

    async fn handle_start(&self, req: StartSession, ctx: &mut ConnectionContext) -> RouterResult {
        info!(
            connection_id = %ctx.connection_id,
            owner = %ctx.identity.user_id,
            kind = %req.kind,
            "Starting session"
        );

        let session_id = self
            .session_manager
            .start(&ctx.identity, req, ctx.subscriber())
            .await?;
        self.prune_closed(ctx);
        ctx.joined.insert(session_id);
        Ok(None)
    }

    /// Forgets sessions that closed since the connection joined them.
    fn prune_closed(&self, ctx: &mut ConnectionContext) {
        ctx.joined.retain(|id| self.session_manager.contains(id));
    }

    async fn handle_join(&self, req: JoinSession, ctx: &mut ConnectionContext) -> RouterResult {
        info!(
            connection_id = %ctx.connection_id,
            session_id = %req.session_id,
            "Joining session"
        );

        self.session_manager
            .join(&ctx.identity, &req.session_id, ctx.subscriber())
            .await?;
        self.prune_closed(ctx);
        ctx.joined.insert(req.session_id);
        Ok(None)
    }

    async fn handle_leave(&self, req: LeaveSession, ctx: &mut ConnectionContext) -> RouterResult {
        ctx.joined.remove(&req.session_id);
        self.session_manager
            .leave(&req.session_id, &ctx.connection_id)
            .await?;
        Ok(None)
    }

    async fn handle_input(&self, req: SessionInput, ctx: &mut ConnectionContext) -> RouterResult {
        if req.bytes.is_empty() {
            return Ok(None);
        }
        self.session_manager
            .forward_input(&ctx.identity, &req.session_id, &ctx.connection_id, req.bytes)
            .await?;
        Ok(None)
    }

    async fn handle_resize(&self, req: ResizeSession, ctx: &mut ConnectionContext) -> RouterResult {
        let geometry = Geometry::new(req.cols, req.rows);
        if !geometry.is_valid() {
            return Err(RouterError::InvalidRequest(format!(
                "invalid geometry {}x{}",
                req.cols, req.rows
            )));
        }

        debug!(
            session_id = %req.session_id,
            cols = req.cols,
            rows = req.rows,
            "Resizing session"
        );
        self.session_manager
            .resize(&ctx.identity, &req.session_id, &ctx.connection_id, geometry)
            .await?;
        Ok(None)
    }
}

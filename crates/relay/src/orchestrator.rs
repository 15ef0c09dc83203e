//! Relay orchestrator for wiring together all components.
//!
//! This module provides the `RelayOrchestrator` that builds the Auth Guard,
//! session manager, message router and gateway from a configuration, runs
//! the accept loop and the idle reaper, and shuts everything down in order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use protocol::messages::StartSession;
use protocol::CloseReason;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AuthGuard;
use crate::config::Config;
use crate::gateway::{Gateway, GatewaySettings};
use crate::router::{MessageRouter, RouterError};
use crate::session::{SessionId, SessionManager, SessionManagerImpl};

/// Message sent with `session_closed` when the relay shuts down.
pub const SHUTDOWN_MESSAGE: &str = "server shutting down";

/// Message sent with `session_closed` when the owner logs out.
pub const LOGOUT_MESSAGE: &str = "logged out";

/// What a logout tore down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogoutSummary {
    /// Sessions of the user that were closed.
    pub sessions: usize,
    /// Connections of the user that were closed.
    pub connections: usize,
}

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding the listener.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A client connection was upgraded or refused.
    ConnectionOpened { peer: SocketAddr },
    /// A client connection ended.
    ConnectionClosed { peer: SocketAddr },
    /// Idle sessions were closed.
    SessionsReaped { count: usize },
}

/// Relay orchestrator that manages all subsystems.
pub struct RelayOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Auth Guard shared with the gateway and the router.
    guard: Arc<AuthGuard>,
    /// Session manager owning every live session.
    session_manager: Arc<SessionManagerImpl>,
    /// Message router shared by all connections.
    router: Arc<MessageRouter<SessionManagerImpl>>,
    /// Gateway accepting client connections.
    gateway: Gateway,
    /// Number of open connections.
    connections: Arc<AtomicUsize>,
    /// Stops the accept loop and the reaper.
    shutdown_token: CancellationToken,
    /// Closes open connections once sessions are gone.
    connections_token: CancellationToken,
    /// Address bound by `start`.
    local_addr: Option<SocketAddr>,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl RelayOrchestrator {
    /// Creates a new orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let guard = Arc::new(AuthGuard::new(&config.auth));
        let session_manager = Arc::new(SessionManagerImpl::new(
            config.session.clone(),
            config.relay.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&session_manager),
            Arc::clone(&guard),
        ));

        let connections_token = CancellationToken::new();
        let gateway = Gateway::new(
            Arc::clone(&guard),
            Arc::clone(&router),
            GatewaySettings::from_config(&config),
            connections_token.clone(),
        );

        let (event_tx, _) = broadcast::channel(100);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            guard,
            session_manager,
            router,
            gateway,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_token: CancellationToken::new(),
            connections_token,
            local_addr: None,
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// the configured port is 0.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        let listen = self.config.listen_addr()?;
        let listener = match TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind {}", listen))
        {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                return Err(e);
            }
        };
        let local_addr = listener.local_addr().context("Failed to read bound address")?;
        self.local_addr = Some(local_addr);

        tokio::spawn(accept_loop(
            listener,
            self.gateway.clone(),
            Arc::clone(&self.connections),
            self.event_tx.clone(),
            self.shutdown_token.clone(),
        ));
        debug!("Started accept loop");

        tokio::spawn(reap_loop(
            Arc::clone(&self.session_manager),
            self.config.relay.reap_interval(),
            self.event_tx.clone(),
            self.shutdown_token.clone(),
        ));
        debug!("Started idle reaper");

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(address = %local_addr, "Relay listening");
        Ok(local_addr)
    }

    /// Stops the relay gracefully.
    ///
    /// Stops accepting, closes every session (members receive
    /// `session_closed` with [`SHUTDOWN_MESSAGE`]), then closes the
    /// remaining connections.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping relay...");
        self.shutdown_token.cancel();

        for session in self.session_manager.list().await {
            debug!(
                session_id = %session.id,
                owner = %session.owner,
                kind = %session.kind,
                state = %session.state,
                members = session.members,
                pid = ?session.pid,
                "Closing session"
            );
        }
        let remaining = self.session_manager.shutdown(SHUTDOWN_MESSAGE).await;
        if remaining > 0 {
            warn!(remaining, "Some sessions did not finish closing");
        }

        self.connections_token.cancel();

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Relay stopped");
        Ok(())
    }

    /// Starts an upload-triggered execution for the holder of `token`.
    ///
    /// The session starts detached; the returned id is handed to the client,
    /// which joins it to receive the buffered output.
    pub async fn submit(&self, token: &str, request: StartSession) -> Result<SessionId, RouterError> {
        self.router.submit(token, request).await
    }

    /// Tears down everything of a user that logged out.
    ///
    /// Revokes the user's current tokens, closes and waits for each of their
    /// sessions (members are told [`LOGOUT_MESSAGE`]), then closes their
    /// remaining connections.
    pub async fn logout(&self, user_id: &str) -> LogoutSummary {
        info!(user = %user_id, "Logging out");
        self.guard.revoke(user_id);

        let sessions = self
            .session_manager
            .close_owner(
                user_id,
                CloseReason::OwnerDisconnected,
                Some(LOGOUT_MESSAGE.to_string()),
            )
            .await;
        let connections = self.gateway.disconnect_user(user_id);

        LogoutSummary {
            sessions,
            connections,
        }
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session manager.
    pub fn session_manager(&self) -> &Arc<SessionManagerImpl> {
        &self.session_manager
    }

    /// Returns the Auth Guard.
    pub fn guard(&self) -> &Arc<AuthGuard> {
        &self.guard
    }

    /// Returns the gateway.
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Returns the message router.
    pub fn router(&self) -> &Arc<MessageRouter<SessionManagerImpl>> {
        &self.router
    }

    /// Returns the address bound by `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

async fn accept_loop(
    listener: TcpListener,
    gateway: Gateway,
    connections: Arc<AtomicUsize>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let gateway = gateway.clone();
        let connections = Arc::clone(&connections);
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            connections.fetch_add(1, Ordering::SeqCst);
            let _ = event_tx.send(OrchestratorEvent::ConnectionOpened { peer });

            if let Err(e) = gateway.accept(stream, peer).await {
                debug!(%peer, error = %e, "Connection not upgraded");
            }

            connections.fetch_sub(1, Ordering::SeqCst);
            let _ = event_tx.send(OrchestratorEvent::ConnectionClosed { peer });
        });
    }
    debug!("Accept loop stopped");
}

async fn reap_loop(
    session_manager: Arc<SessionManagerImpl>,
    interval: std::time::Duration,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let count = session_manager.reap_idle().await;
                if count > 0 {
                    info!(count, "Reaped idle sessions");
                    let _ = event_tx.send(OrchestratorEvent::SessionsReaped { count });
                }
            }
        }
    }
    debug!("Idle reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, Identity};
    use protocol::SessionKind;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.listen = "127.0.0.1:0".to_string();
        config.auth.secret = "orchestrator-test-secret".to_string();
        config.session.default_shell = "/bin/sh".to_string();
        config.session.workspace_root = temp_dir.path().to_path_buf();
        config.relay.termination_grace_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = RelayOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert_eq!(orchestrator.connection_count(), 0);
        assert!(orchestrator.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.session.max_sessions = 0;
        assert!(RelayOrchestrator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = RelayOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        let mut events = orchestrator.subscribe();

        let addr = orchestrator.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(orchestrator.start().await.is_err());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.shutdown_token().is_cancelled());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped,
            ]
        );

        // Stopping twice is harmless.
        orchestrator.stop().await.unwrap();
    }

    fn exec(command: &str) -> StartSession {
        StartSession {
            kind: SessionKind::ExecutionLog,
            command: Some(command.to_string()),
            ..StartSession::default()
        }
    }

    #[tokio::test]
    async fn test_submit_requires_valid_token() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = RelayOrchestrator::new(create_test_config(&temp_dir)).unwrap();

        let err = orchestrator
            .submit("forged.token", exec("sleep 30"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Auth(AuthError::Unauthenticated)));
        assert_eq!(orchestrator.session_manager().count(), 0);

        let token = orchestrator
            .guard()
            .issue(&Identity::new("alice"), Duration::from_secs(60))
            .unwrap();
        let id = orchestrator.submit(&token, exec("sleep 30")).await.unwrap();
        let sessions = orchestrator.session_manager().list().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, id);
        assert_eq!(sessions[0].owner, "alice");

        orchestrator.session_manager().shutdown("test over").await;
    }

    #[tokio::test]
    async fn test_logout_closes_sessions_and_revokes() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = RelayOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        let token = orchestrator
            .guard()
            .issue(&Identity::new("alice"), Duration::from_secs(60))
            .unwrap();
        let bob = orchestrator
            .guard()
            .issue(&Identity::new("bob"), Duration::from_secs(60))
            .unwrap();
        orchestrator.submit(&token, exec("sleep 30")).await.unwrap();
        orchestrator.submit(&bob, exec("sleep 30")).await.unwrap();

        let summary = orchestrator.logout("alice").await;
        assert_eq!(summary.sessions, 1);
        assert_eq!(summary.connections, 0);
        assert_eq!(orchestrator.session_manager().count(), 1);

        // The token from before the logout no longer works.
        assert!(orchestrator.submit(&token, exec("true")).await.is_err());
        assert!(orchestrator.guard().verify(&bob).is_ok());

        orchestrator.session_manager().shutdown("test over").await;
    }

    #[tokio::test]
    async fn test_bind_failure_resets_state() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = create_test_config(&temp_dir);
        config.server.listen = blocker.local_addr().unwrap().to_string();

        let mut orchestrator = RelayOrchestrator::new(config).unwrap();
        assert!(orchestrator.start().await.is_err());
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }
}

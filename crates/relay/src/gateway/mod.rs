//! Connection Gateway.
//!
//! Terminates client WebSocket connections, authenticates them during the
//! upgrade and runs one reader/writer task pair per connection that feeds the
//! message router. Open connections are registered per user so that a logout
//! can close all of them.
//!
//! - [`handshake`]: origin, authentication and wire format checks
//! - [`connection`]: the per-connection task pair

pub mod connection;
pub mod handshake;

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthGuard;
use crate::config::Config;
use crate::router::MessageRouter;
use crate::session::{ConnectionId, SessionManagerImpl};

pub use handshake::{check_request, Handshake};

/// Errors raised while accepting a connection.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The WebSocket upgrade failed or was refused.
    #[error("handshake with {peer} failed: {source}")]
    Handshake {
        peer: SocketAddr,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-level settings taken from the configuration.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Accepted `Origin` values; empty accepts any.
    pub allowed_origins: Vec<String>,
    /// Largest inbound message accepted.
    pub max_message_bytes: usize,
    /// Capacity of each connection's outbound queue.
    pub connection_queue_capacity: usize,
}

impl GatewaySettings {
    /// Extracts the gateway settings from a configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            allowed_origins: config.server.allowed_origins.clone(),
            max_message_bytes: config.server.max_message_bytes,
            connection_queue_capacity: config.relay.connection_queue_capacity,
        }
    }
}

/// Open connections: id to owning user and the token that closes it.
type ConnectionRegistry = DashMap<ConnectionId, (String, CancellationToken)>;

/// Removes a connection from the registry when its task ends.
struct Registration {
    connections: Arc<ConnectionRegistry>,
    connection_id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.connections.remove(&self.connection_id);
    }
}

/// Accepts and serves client connections.
#[derive(Clone)]
pub struct Gateway {
    guard: Arc<AuthGuard>,
    router: Arc<MessageRouter<SessionManagerImpl>>,
    settings: GatewaySettings,
    cancel: CancellationToken,
    connections: Arc<ConnectionRegistry>,
}

impl Gateway {
    /// Creates a gateway. Cancelling `cancel` closes every open connection.
    pub fn new(
        guard: Arc<AuthGuard>,
        router: Arc<MessageRouter<SessionManagerImpl>>,
        settings: GatewaySettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            guard,
            router,
            settings,
            cancel,
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Closes every open connection of `user_id`.
    ///
    /// Returns the number of connections told to close.
    pub fn disconnect_user(&self, user_id: &str) -> usize {
        let mut closed = 0;
        for entry in self.connections.iter() {
            let (owner, cancel) = entry.value();
            if owner == user_id {
                cancel.cancel();
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::info!(user = %user_id, connections = closed, "Disconnecting user");
        }
        closed
    }

    /// Returns the number of open connections of `user_id`.
    pub fn connection_count(&self, user_id: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().0 == user_id)
            .count()
    }

    /// Upgrades a TCP stream and serves it until the connection ends.
    ///
    /// Returns an error only when the upgrade itself fails, which includes
    /// requests refused by the origin or authentication checks.
    pub async fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), GatewayError> {
        let mut accepted = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match check_request(request, &self.guard, &self.settings.allowed_origins) {
                Ok(handshake) => {
                    accepted = Some(handshake);
                    Ok(response)
                }
                Err(rejection) => {
                    tracing::info!(
                        %peer,
                        status = %rejection.status(),
                        reason = rejection.body().as_deref().unwrap_or_default(),
                        "Rejected connection"
                    );
                    Err(rejection)
                }
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(|source| GatewayError::Handshake { peer, source })?;

        let Some(handshake) = accepted else {
            // The callback runs before a successful upgrade completes.
            return Ok(());
        };

        tracing::debug!(%peer, user = %handshake.identity.user_id, "Upgraded connection");

        let connection_id = uuid::Uuid::new_v4().simple().to_string();
        let cancel = self.cancel.child_token();
        self.connections.insert(
            connection_id.clone(),
            (handshake.identity.user_id.clone(), cancel.clone()),
        );
        let _registration = Registration {
            connections: Arc::clone(&self.connections),
            connection_id: connection_id.clone(),
        };

        connection::serve(
            ws,
            handshake,
            Arc::clone(&self.router),
            self.settings.clone(),
            cancel,
            connection_id,
        )
        .await;
        Ok(())
    }
}

//! # ShellRelay Library
//!
//! This crate provides the relay service behind ShellRelay: authenticated
//! clients connect over WebSocket, start or join sessions, and exchange
//! process I/O with them in real time.
//!
//! ## Overview
//!
//! - **Auth Guard**: verifies signed identity tokens at connection time and
//!   re-checks them before every operation
//! - **Session Store**: live sessions and their lifecycle state machine
//! - **Process Adapter**: shells on a pseudo-terminal, executions on pipes
//! - **Relay Channel**: per-session membership and bounded output fan-out
//! - **Connection Gateway**: WebSocket upgrade and per-connection tasks
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Relay Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌────────────────────────────────────────┐  │
//! │  │  Auth Guard  │  │          Connection Gateway            │  │
//! │  └──────────────┘  └────────────────────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                     Message Router                         │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │  Session Manager: Store + Relay Channels + Process Adapter │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relay::{Config, RelayOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = RelayOrchestrator::new(config)?;
//!     let addr = orchestrator.start().await?;
//!     println!("listening on {addr}");
//!
//!     tokio::signal::ctrl_c().await?;
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`auth`]: Token verification and issuing
//! - [`session`]: Sessions, processes and relay channels
//! - [`router`]: Client message routing
//! - [`gateway`]: WebSocket connection handling
//! - [`orchestrator`]: Main relay coordinator

pub mod auth;
pub mod config;
pub mod gateway;
pub mod orchestrator;
pub mod router;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use auth::{AuthError, AuthGuard, Identity};
pub use config::Config;
pub use gateway::{Gateway, GatewayError, GatewaySettings};
pub use orchestrator::{LogoutSummary, OrchestratorEvent, OrchestratorState, RelayOrchestrator};
pub use router::{ConnectionContext, MessageRouter, RouterError, RouterResult};
pub use session::{
    SessionError, SessionId, SessionInfo, SessionManager, SessionManagerImpl, SessionState,
};

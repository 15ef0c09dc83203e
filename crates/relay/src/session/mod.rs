//! Session management module.
//!
//! A session binds one owned process (a shell on a pseudo-terminal or a
//! one-shot command on pipes) to a relay channel that fans its output out to
//! the connections attached to it.
//!
//! - [`process`]: spawning, input, resize and termination of the process
//! - [`store`]: session records and the lifecycle state machine
//! - [`channel`]: per-session membership and bounded fan-out
//! - [`manager`]: the operations the router drives

pub mod channel;
pub mod manager;
pub mod process;
pub mod store;

use thiserror::Error;

pub use channel::{RelayChannel, Subscriber};
pub use manager::{SessionInfo, SessionManager, SessionManagerImpl};
pub use process::{OutputChunk, ProcessExit, ProcessHandle, ProcessSpec};
pub use store::{SessionRecord, SessionStore};

/// Unique identifier for a session.
pub type SessionId = String;

/// Unique identifier for a client connection.
pub type ConnectionId = String;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Registered; the process is being spawned.
    Starting,
    /// The process is running and output is relayed.
    Active,
    /// The process is being terminated and trailing output flushed.
    Draining,
    /// Terminal. The record is removed from the store.
    Closed,
}

impl SessionState {
    /// Returns whether moving from `self` to `next` is allowed.
    ///
    /// Draining is only skipped when the spawn fails. A close requested while
    /// the spawn is still in flight is held until the process is attached.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Active) | (Starting, Closed) | (Active, Draining) | (Draining, Closed)
        )
    }

    /// Returns true once the session stopped accepting work.
    pub fn is_terminating(self) -> bool {
        matches!(self, SessionState::Draining | SessionState::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The caller may not access the session.
    #[error("access to session {0} is forbidden")]
    Forbidden(SessionId),

    /// The process could not be started.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// The session is draining or closed.
    #[error("session is closing: {0}")]
    Closed(SessionId),

    /// A lifecycle transition the state machine does not allow.
    #[error("invalid transition for session {id}: {from} -> {to}")]
    InvalidTransition {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },

    /// Too many sessions.
    #[error("session limit exceeded: {0}")]
    LimitExceeded(String),

    /// The request is malformed for this session.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An internal invariant was violated for one session.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        use SessionState::*;
        assert!(Starting.can_transition_to(Active));
        assert!(Starting.can_transition_to(Closed));
        assert!(Active.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Closed));
    }

    #[test]
    fn test_rejected_transitions() {
        use SessionState::*;
        assert!(!Starting.can_transition_to(Draining));
        assert!(!Active.can_transition_to(Closed));
        assert!(!Active.can_transition_to(Starting));
        assert!(!Draining.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Starting));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_is_terminating() {
        assert!(!SessionState::Starting.is_terminating());
        assert!(!SessionState::Active.is_terminating());
        assert!(SessionState::Draining.is_terminating());
        assert!(SessionState::Closed.is_terminating());
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::InvalidTransition {
            id: "s1".to_string(),
            from: SessionState::Active,
            to: SessionState::Closed,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for session s1: active -> closed"
        );
    }
}

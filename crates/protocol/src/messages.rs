//! Protocol message definitions for ShellRelay.
//!
//! This module defines every message exchanged between a browser client and
//! the relay over a real-time connection. Messages are adjacently tagged
//! (`{"type": ..., "data": ...}`) and can be carried as JSON text frames or
//! MessagePack binary frames (see [`crate::codec`]).

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default terminal width used when a client does not negotiate a geometry.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height used when a client does not negotiate a geometry.
pub const DEFAULT_ROWS: u16 = 24;

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a new session and join it.
    Start(StartSession),
    /// Attach to an existing session (reconnect).
    Join(JoinSession),
    /// Detach from a session.
    Leave(LeaveSession),
    /// Bytes for the session's process stdin.
    Input(SessionInput),
    /// Terminal geometry change.
    Resize(ResizeSession),
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The connection is now a member of a session.
    SessionAssigned(SessionAssigned),
    /// A chunk of process output.
    Output(SessionOutput),
    /// Output produced before the first join was partially dropped.
    OutputTruncated(OutputTruncated),
    /// The session is gone; no more output follows for it.
    SessionClosed(SessionClosed),
    /// A request failed.
    Error(ErrorMessage),
}

impl ServerMessage {
    /// Returns the session this message refers to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::SessionAssigned(m) => Some(&m.session_id),
            ServerMessage::Output(m) => Some(&m.session_id),
            ServerMessage::OutputTruncated(m) => Some(&m.session_id),
            ServerMessage::SessionClosed(m) => Some(&m.session_id),
            ServerMessage::Error(m) => m.session_id.as_deref(),
        }
    }
}

// ============================================================================
// Session descriptors
// ============================================================================

/// The kind of process a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// One-shot script run whose output is streamed to the client.
    ExecutionLog,
    /// Persistent pseudo-terminal accepting bidirectional bytes.
    #[default]
    InteractiveShell,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::ExecutionLog => write!(f, "execution_log"),
            SessionKind::InteractiveShell => write!(f, "interactive_shell"),
        }
    }
}

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Terminal columns.
    pub cols: u16,
    /// Terminal rows.
    pub rows: u16,
}

impl Geometry {
    /// Creates a geometry from columns and rows.
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Returns true if both dimensions are non-zero.
    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

/// Where a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputOrigin {
    /// Standard output (and the merged stream of a pseudo-terminal).
    Stdout,
    /// Standard error.
    Stderr,
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The process exited on its own.
    Exited,
    /// The owning connection left or dropped.
    OwnerDisconnected,
    /// Nobody was attached for longer than the idle window.
    IdleTimeout,
    /// Spawn failure, invariant violation, or server shutdown.
    Error,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::Exited => "exited",
            CloseReason::OwnerDisconnected => "owner_disconnected",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Error => "error",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Client -> relay
// ============================================================================

/// Request to create a new session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StartSession {
    /// Kind of session to create.
    pub kind: SessionKind,
    /// Requested geometry (default 80x24).
    #[serde(default)]
    pub geometry: Option<Geometry>,
    /// Command line for an execution session, run through `/bin/sh -c`.
    #[serde(default)]
    pub command: Option<String>,
    /// Script path relative to the owner's workspace, run with the interpreter.
    #[serde(default)]
    pub script: Option<String>,
}

/// Request to attach to an existing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSession {
    /// Session to attach to.
    pub session_id: String,
}

/// Request to detach from a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveSession {
    /// Session to detach from.
    pub session_id: String,
}

/// Input bytes for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInput {
    /// Target session.
    pub session_id: String,
    /// Raw bytes for the process stdin.
    #[serde(with = "crate::payload")]
    pub bytes: Vec<u8>,
}

/// Terminal resize request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeSession {
    /// Target session.
    pub session_id: String,
    /// New terminal columns.
    pub cols: u16,
    /// New terminal rows.
    pub rows: u16,
}

// ============================================================================
// Relay -> client
// ============================================================================

/// Confirms membership of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAssigned {
    /// The session the connection now receives output from.
    pub session_id: String,
    /// Kind of the session.
    pub kind: SessionKind,
}

/// A chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutput {
    /// Session that produced the output.
    pub session_id: String,
    /// Stream the bytes were read from.
    pub origin: OutputOrigin,
    /// Output bytes, unmodified.
    #[serde(with = "crate::payload")]
    pub bytes: Vec<u8>,
}

/// Marker emitted before buffered output when the pre-join buffer overflowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTruncated {
    /// Session whose early output was dropped.
    pub session_id: String,
    /// Number of bytes dropped from the front of the buffer.
    pub dropped_bytes: u64,
}

/// Session closed notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClosed {
    /// Session that was closed.
    pub session_id: String,
    /// Why it closed.
    pub reason: CloseReason,
    /// Exit code if the process exited normally.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Signal number if the process was killed by a signal.
    #[serde(default)]
    pub signal: Option<i32>,
    /// Human-readable detail (spawn error text, shutdown notice).
    #[serde(default)]
    pub message: Option<String>,
}

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Session the failed request referred to.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Whether retrying the request can succeed.
    pub recoverable: bool,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Missing or invalid credentials.
    Unauthenticated,
    /// Credentials past their validity window.
    Expired,
    /// Unknown session.
    NotFound,
    /// The connection may not access the session.
    Forbidden,
    /// Malformed or unsupported request.
    InvalidRequest,
    /// The process could not be started.
    SpawnFailed,
    /// Too many sessions.
    LimitExceeded,
    /// The member fell too far behind and was dropped.
    SlowConsumer,
    /// Server-side error.
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_wire_shape() {
        let json = r#"{"type":"start","data":{"kind":"execution_log","command":"python script.py"}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Start(StartSession {
                kind: SessionKind::ExecutionLog,
                geometry: None,
                command: Some("python script.py".to_string()),
                script: None,
            })
        );
    }

    #[test]
    fn test_start_with_geometry() {
        let json = r#"{"type":"start","data":{"kind":"interactive_shell","geometry":{"cols":120,"rows":40}}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Start(start) => {
                assert_eq!(start.kind, SessionKind::InteractiveShell);
                assert_eq!(start.geometry, Some(Geometry::new(120, 40)));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_input_bytes_are_base64_in_json() {
        let msg = ClientMessage::Input(SessionInput {
            session_id: "s1".to_string(),
            bytes: b"ls\r".to_vec(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"input","data":{"session_id":"s1","bytes":"bHMN"}}"#
        );
    }

    #[test]
    fn test_output_wire_shape() {
        let msg = ServerMessage::Output(SessionOutput {
            session_id: "s1".to_string(),
            origin: OutputOrigin::Stderr,
            bytes: b"oops\n".to_vec(),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "output");
        assert_eq!(value["data"]["origin"], "stderr");
        assert_eq!(value["data"]["bytes"], "b29wcwo=");
    }

    #[test]
    fn test_session_closed_reason_names() {
        for (reason, name) in [
            (CloseReason::Exited, "exited"),
            (CloseReason::OwnerDisconnected, "owner_disconnected"),
            (CloseReason::IdleTimeout, "idle_timeout"),
            (CloseReason::Error, "error"),
        ] {
            let value = serde_json::to_value(reason).unwrap();
            assert_eq!(value, name);
            assert_eq!(reason.to_string(), name);
        }
    }

    #[test]
    fn test_session_closed_optional_fields_default() {
        let json = r#"{"type":"session_closed","data":{"session_id":"s1","reason":"idle_timeout"}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ServerMessage::SessionClosed(SessionClosed {
                session_id: "s1".to_string(),
                reason: CloseReason::IdleTimeout,
                exit_code: None,
                signal: None,
                message: None,
            })
        );
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let json = r#"{"type":"kill","data":{"session_id":"s1"}}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn test_server_message_session_id() {
        let msg = ServerMessage::Error(ErrorMessage {
            code: ErrorCode::NotFound,
            message: "missing".to_string(),
            session_id: None,
            recoverable: false,
        });
        assert_eq!(msg.session_id(), None);

        let msg = ServerMessage::SessionAssigned(SessionAssigned {
            session_id: "abc".to_string(),
            kind: SessionKind::ExecutionLog,
        });
        assert_eq!(msg.session_id(), Some("abc"));
    }

    #[test]
    fn test_default_geometry() {
        let geometry = Geometry::default();
        assert_eq!(geometry, Geometry::new(DEFAULT_COLS, DEFAULT_ROWS));
        assert!(geometry.is_valid());
        assert!(!Geometry::new(0, 24).is_valid());
    }
}

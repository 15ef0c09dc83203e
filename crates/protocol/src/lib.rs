//! # ShellRelay Protocol Library
//!
//! This crate defines the real-time protocol spoken between browser clients
//! and the ShellRelay relay.
//!
//! ## Overview
//!
//! - **Message Definitions**: client requests (`start`, `join`, `leave`,
//!   `input`, `resize`) and relay events (`session_assigned`, `output`,
//!   `output_truncated`, `session_closed`, `error`)
//! - **Wire Codec**: JSON text frames or MessagePack binary frames
//! - **Payload Encoding**: raw bytes as base64 in JSON, native bin in MessagePack
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application Messages           │  ClientMessage / ServerMessage
//! ├─────────────────────────────────────────┤
//! │              Wire Codec                 │  JSON (text) / MessagePack (binary)
//! ├─────────────────────────────────────────┤
//! │          Transport (WebSocket)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::codec::{decode_text, Encoded, WireFormat, MAX_MESSAGE_SIZE};
//! use protocol::messages::{ClientMessage, SessionKind, StartSession};
//!
//! let start = ClientMessage::Start(StartSession {
//!     kind: SessionKind::InteractiveShell,
//!     ..Default::default()
//! });
//!
//! let Encoded::Text(json) = WireFormat::Json.encode(&start).unwrap() else {
//!     unreachable!()
//! };
//! let decoded: ClientMessage = decode_text(&json, MAX_MESSAGE_SIZE).unwrap();
//! assert_eq!(decoded, start);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`codec`]: Wire formats and frame decoding
//! - [`payload`]: Serde helpers for byte payloads
//! - [`error`]: Error types

pub mod codec;
pub mod error;
pub mod messages;
pub mod payload;

pub use codec::{Encoded, WireFormat, MAX_MESSAGE_SIZE};
pub use error::{ProtocolError, Result};
pub use messages::{
    ClientMessage, CloseReason, ErrorCode, Geometry, OutputOrigin, ServerMessage, SessionKind,
    PROTOCOL_VERSION,
};

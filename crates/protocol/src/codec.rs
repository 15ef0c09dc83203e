//! Wire codec for real-time frames.
//!
//! A connection speaks one of two formats for outbound messages: JSON in
//! text frames (the default, what a browser `WebSocket` reads most easily) or
//! MessagePack in binary frames. Inbound frames are decoded by frame type,
//! so a client may mix the two.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Maximum size of a single encoded message accepted by default (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Encoded message, ready to be placed in a transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// UTF-8 JSON for a text frame.
    Text(String),
    /// MessagePack for a binary frame.
    Binary(Vec<u8>),
}

impl Encoded {
    /// Returns the encoded length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(s) => s.len(),
            Encoded::Binary(b) => b.len(),
        }
    }

    /// Returns true if the encoded message is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outbound wire format of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    Json,
    /// MessagePack binary frames with named fields.
    MessagePack,
}

impl WireFormat {
    /// Parses a format name as given in a handshake query (`json`, `msgpack`).
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "msgpack" | "messagepack" => Ok(WireFormat::MessagePack),
            other => Err(ProtocolError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Encodes a message in this format.
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Encoded> {
        match self {
            WireFormat::Json => Ok(Encoded::Text(serde_json::to_string(message)?)),
            WireFormat::MessagePack => Ok(Encoded::Binary(rmp_serde::to_vec_named(message)?)),
        }
    }
}

/// Decodes a JSON text frame.
pub fn decode_text<T: DeserializeOwned>(text: &str, max_size: usize) -> Result<T> {
    check_size(text.len(), max_size)?;
    Ok(serde_json::from_str(text)?)
}

/// Decodes a MessagePack binary frame.
pub fn decode_binary<T: DeserializeOwned>(bytes: &[u8], max_size: usize) -> Result<T> {
    check_size(bytes.len(), max_size)?;
    Ok(rmp_serde::from_slice(bytes)?)
}

fn check_size(size: usize, max: usize) -> Result<()> {
    if size > max {
        return Err(ProtocolError::FrameTooLarge { size, max });
    }
    Ok(())
}

//! JSON wire protocol for room synchronization.
//!
//! Every frame is a JSON object with a `type` discriminator:
//!
//! ```text
//! ┌───────────────┬───────────────┬──────────────────────────────────┐
//! │ direction     │ type          │ fields                           │
//! ├───────────────┼───────────────┼──────────────────────────────────┤
//! │ server→client │ initial_state │ code — sent once on acceptance   │
//! │ server→client │ code_update   │ code — full replacement buffer   │
//! │ client→server │ code_change   │ code — requested replacement     │
//! └───────────────┴───────────────┴──────────────────────────────────┘
//! ```
//!
//! Payloads always carry the full buffer, never a diff: any client, however
//! far behind, converges on the next delivered frame.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Current buffer, sent exactly once immediately after acceptance.
    InitialState { code: String },
    /// Full replacement buffer, fanned out to every peer but the editor.
    CodeUpdate { code: String },
}

impl ServerMessage {
    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Serialize straight into a WebSocket text frame.
    pub fn to_frame(&self) -> Result<Message, ProtocolError> {
        Ok(Message::text(self.encode()?))
    }
}

/// Frames accepted from clients.
///
/// `code` is optional at the serde level so that a `code_change` with the
/// field missing still parses; the session discards it instead of dropping
/// the connection. Unrecognized `type` values collapse into [`Self::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request to replace the shared buffer.
    CodeChange { code: Option<String> },
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parse a raw text frame.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Why the server closed a connection before or during streaming.
///
/// Both map to close codes in the library range (4000-4999) so clients can
/// distinguish them from transport-level closures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The requested room id is unknown.
    RoomNotFound,
    /// The room already holds `max_connections_per_room` members.
    RoomFull,
}

impl CloseReason {
    /// Close status code sent on the wire.
    pub fn code(&self) -> CloseCode {
        match self {
            CloseReason::RoomNotFound => CloseCode::Library(4004),
            CloseReason::RoomFull => CloseCode::Library(4003),
        }
    }

    /// Human-readable close reason.
    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::RoomNotFound => "room not found",
            CloseReason::RoomFull => "room at capacity",
        }
    }

    /// Build the close frame for this rejection.
    pub fn frame(&self) -> CloseFrame {
        CloseFrame {
            code: self.code(),
            reason: self.reason().into(),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Encode error: {e}"),
            Self::Decode(e) => write!(f, "Decode error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

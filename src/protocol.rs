//! Wire protocol for the duplex channel
//!
//! All messages are JSON objects tagged by a `type` field.
//!
//! ```text
//! client -> server   {"type":"init","preferences":{...}}
//! client -> server   {"type":"frame","frame":"<base64 jpeg>"}
//! server -> client   {"type":"ready"}
//! server -> client   {"type":"audio","audio":"<base64 audio>"}
//! ```

use serde::{Deserialize, Serialize};

use crate::config::SessionPreferences;
use crate::error::TransportError;

/// Messages sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Handshake, first message after the channel opens
    Init { preferences: SessionPreferences },
    /// One sampled frame, base64 JPEG without a MIME prefix
    Frame { frame: String },
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Handshake acknowledged; frames may be sent
    Ready,
    /// One synthesized utterance, base64 encoded
    Audio { audio: String },
    /// Any other `type` value
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn init(preferences: SessionPreferences) -> Self {
        ClientMessage::Init { preferences }
    }

    /// Build a frame message, stripping a `data:...;base64,` prefix if present
    pub fn frame(payload: &str) -> Self {
        ClientMessage::Frame {
            frame: strip_data_url(payload).to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing these plain structs cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::InvalidMessage(e.to_string()))
    }
}

/// Remove a data URL header, leaving only the base64 body
pub fn strip_data_url(payload: &str) -> &str {
    if payload.starts_with("data:") {
        if let Some((_, body)) = payload.split_once(',') {
            return body;
        }
    }
    payload
}

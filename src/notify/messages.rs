//! WebSocket Message Types
//!
//! Control messages exchanged with observer sessions. Alert frames are not
//! wrapped: observers receive the event JSON exactly as it is stored.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A serialized text frame, shared between every session it is sent to
pub type Frame = Arc<str>;

/// Messages sent from client to server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ping for keepalive
    Ping,
}

/// Control messages sent from server to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session established
    Connected {
        /// Unique session identifier
        session_id: String,
    },
    /// Pong response to ping
    Pong,
    /// Error message
    Error {
        /// Error description
        message: String,
    },
}

impl ServerMessage {
    pub fn to_frame(&self) -> Frame {
        match serde_json::to_string(self) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize server message");
                Arc::from(r#"{"type":"error","message":"internal error"}"#)
            }
        }
    }
}

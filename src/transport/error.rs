//! Transport error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the broker session
#[derive(Error, Debug)]
pub enum TransportError {
    /// Every connection attempt failed
    #[error("Connection failed after {attempts} attempts: {reason}")]
    Connection { attempts: u32, reason: String },

    /// A single broker operation failed (connect refused, timeout, I/O)
    #[error("Broker error: {0}")]
    Broker(String),

    /// No active session
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// TLS material missing or unreadable
    #[error("Credential file {path:?} unusable: {reason}")]
    Credentials { path: PathBuf, reason: String },

    /// Control payload could not be encoded
    #[error("Invalid payload: {0}")]
    Payload(String),

    /// Connect was interrupted by `disconnect`
    #[error("Connection cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Payload(err.to_string())
    }
}

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

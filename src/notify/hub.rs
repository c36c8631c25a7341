//! Notification Hub
//!
//! Tracks connected observer sessions and fans alert events out to all of
//! them. Delivery is at-most-once: nothing is queued for observers that are
//! not connected, each session queues at most `session_buffer` frames, and
//! a session whose socket task is gone is pruned without affecting the
//! others.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::messages::Frame;
use crate::storage::Event;

/// Unique identifier for an observer session
pub type SessionId = String;

/// Receives alert events from the router
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Push an event to every connected observer; returns how many got it
    async fn broadcast(&self, event: &Event) -> usize;
}

/// Configuration for the notification hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of concurrent sessions
    pub max_sessions: usize,
    /// Frames queued per session before new ones are skipped
    pub session_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            session_buffer: 64,
        }
    }
}

/// Registry of observer sessions
pub struct NotificationHub {
    sessions: RwLock<HashMap<SessionId, mpsc::Sender<Frame>>>,
    config: HubConfig,
}

impl NotificationHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Open a session and return the queue its socket task drains
    pub async fn register(
        &self,
    ) -> Result<(SessionId, mpsc::Receiver<Frame>), NotificationError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.config.max_sessions {
            return Err(NotificationError::TooManySessions(self.config.max_sessions));
        }

        let (tx, rx) = mpsc::channel(self.config.session_buffer.max(1));
        let id = Uuid::new_v4().to_string();
        sessions.insert(id.clone(), tx);

        tracing::info!(session_id = %id, sessions = sessions.len(), "Observer connected");
        Ok((id, rx))
    }

    pub async fn unregister(&self, id: &str) {
        if self.sessions.write().await.remove(id).is_some() {
            tracing::info!(session_id = %id, "Observer disconnected");
        }
    }

    /// Offer one pre-serialized frame to every session without waiting
    ///
    /// A session with a full queue misses this frame; a closed one is
    /// removed.
    pub async fn broadcast_frame(&self, frame: Frame) -> usize {
        let mut closed = Vec::new();
        let delivered = {
            let sessions = self.sessions.read().await;
            let mut delivered = 0;
            for (id, sender) in sessions.iter() {
                match sender.try_send(Arc::clone(&frame)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        let err = NotificationError::Lagging(id.clone());
                        tracing::warn!(error = %err, "Alert skipped for observer");
                    }
                    Err(TrySendError::Closed(_)) => {
                        let err = NotificationError::SendFailed(id.clone());
                        tracing::warn!(error = %err, "Dropping unreachable observer");
                        closed.push(id.clone());
                    }
                }
            }
            delivered
        };

        if !closed.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &closed {
                sessions.remove(id);
            }
        }

        delivered
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl Notifier for NotificationHub {
    async fn broadcast(&self, event: &Event) -> usize {
        let frame: Frame = match serde_json::to_string(event) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                tracing::error!(error = %e, identity = %event.identity(), "Failed to serialize alert");
                return 0;
            }
        };

        let delivered = self.broadcast_frame(frame).await;
        tracing::debug!(
            device_id = event.device_id,
            event = %event.name,
            observers = delivered,
            "Alert broadcast"
        );
        delivered
    }
}

/// Errors that can occur in the notification hub
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Too many sessions (limit: {0})")]
    TooManySessions(usize),

    #[error("Session {0} is not draining its queue")]
    Lagging(String),

    #[error("Failed to send to session {0}")]
    SendFailed(String),
}

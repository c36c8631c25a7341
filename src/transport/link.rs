//! Seams between the session manager and a concrete broker client

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::credentials::Credentials;
use super::error::TransportResult;

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// What an open session reports back
#[derive(Debug)]
pub enum LinkEvent {
    Message(InboundMessage),
    /// The session dropped; no more events follow
    Lost(String),
}

/// Operations on one open broker session
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Subscribe with at-least-once delivery
    async fn subscribe(&self, topic: &str) -> TransportResult<()>;

    /// Publish with at-least-once delivery
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()>;

    async fn close(&self);
}

/// A freshly opened session and its event stream
pub struct OpenedLink {
    pub link: Arc<dyn BrokerLink>,
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Opens broker sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Check local prerequisites before the first attempt.
    ///
    /// Failures here are not retried.
    fn verify(&self, _credentials: &Credentials) -> TransportResult<()> {
        Ok(())
    }

    /// One connection attempt
    async fn open(&self, credentials: &Credentials) -> TransportResult<OpenedLink>;
}

//! In-process broker
//!
//! Implements `Connector` without a network so the pipeline can run in
//! tests and local demos. Supports scripted connection failures, injected
//! messages and forced session loss.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::credentials::Credentials;
use super::error::{TransportError, TransportResult};
use super::link::{BrokerLink, Connector, InboundMessage, LinkEvent, OpenedLink};

const SESSION_CAPACITY: usize = 256;

struct SessionEntry {
    events: mpsc::Sender<LinkEvent>,
    filters: HashSet<String>,
}

#[derive(Default)]
struct BrokerState {
    next_session: u64,
    sessions: HashMap<u64, SessionEntry>,
    fail_next: u32,
    open_attempts: u32,
    published: Vec<InboundMessage>,
    subscribe_log: Vec<String>,
}

/// Broker living in this process; clones share state
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuse the next `n` connection attempts
    pub fn fail_next_opens(&self, n: u32) {
        self.lock().fail_next = n;
    }

    pub fn open_attempts(&self) -> u32 {
        self.lock().open_attempts
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Everything published by clients, oldest first
    pub fn published(&self) -> Vec<InboundMessage> {
        self.lock().published.clone()
    }

    /// Every subscribe call, in order, across all sessions
    pub fn subscribe_log(&self) -> Vec<String> {
        self.lock().subscribe_log.clone()
    }

    /// Deliver a message as if a device published it
    ///
    /// Returns the number of sessions it reached.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let message = InboundMessage::new(topic, payload);
        let targets = self.matching_sessions(topic);

        let mut delivered = 0;
        for sender in targets {
            if sender.send(LinkEvent::Message(message.clone())).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Sever every open session
    pub async fn drop_connections(&self, reason: &str) {
        let sessions: Vec<_> = self.lock().sessions.drain().map(|(_, s)| s.events).collect();
        for sender in sessions {
            let _ = sender.send(LinkEvent::Lost(reason.to_string())).await;
        }
    }

    fn matching_sessions(&self, topic: &str) -> Vec<mpsc::Sender<LinkEvent>> {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.filters.iter().any(|f| topic_matches(f, topic)))
            .map(|s| s.events.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open(&self, credentials: &Credentials) -> TransportResult<OpenedLink> {
        let (tx, rx) = mpsc::channel(SESSION_CAPACITY);

        let id = {
            let mut state = self.lock();
            state.open_attempts += 1;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(TransportError::Broker("connection refused".to_string()));
            }
            state.next_session += 1;
            let id = state.next_session;
            state.sessions.insert(
                id,
                SessionEntry {
                    events: tx,
                    filters: HashSet::new(),
                },
            );
            id
        };

        tracing::debug!(client_id = %credentials.client_id, session = id, "Memory session opened");
        Ok(OpenedLink {
            link: Arc::new(MemoryLink {
                broker: self.clone(),
                id,
            }),
            events: rx,
        })
    }
}

struct MemoryLink {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn subscribe(&self, topic: &str) -> TransportResult<()> {
        let mut guard = self.broker.lock();
        let state = &mut *guard;
        let session = state
            .sessions
            .get_mut(&self.id)
            .ok_or_else(|| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "session closed".to_string(),
            })?;
        session.filters.insert(topic.to_string());
        state.subscribe_log.push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()> {
        {
            let mut state = self.broker.lock();
            if !state.sessions.contains_key(&self.id) {
                return Err(TransportError::Publish {
                    topic: topic.to_string(),
                    reason: "session closed".to_string(),
                });
            }
            state
                .published
                .push(InboundMessage::new(topic, payload.clone()));
        }
        self.broker.inject(topic, payload).await;
        Ok(())
    }

    async fn close(&self) {
        self.broker.lock().sessions.remove(&self.id);
    }
}

/// MQTT topic filter match with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("apm/server", "apm/server"));
        assert!(!topic_matches("apm/server", "apm/config"));
        assert!(topic_matches("apm/+", "apm/config"));
        assert!(!topic_matches("apm/+", "apm/config/extra"));
        assert!(topic_matches("apm/#", "apm/config/extra"));
        assert!(topic_matches("#", "esp32/data"));
        assert!(!topic_matches("apm/server/x", "apm/server"));
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_opens(1);
        let credentials = Credentials::plain("memory", 1883, "test");

        assert!(broker.open(&credentials).await.is_err());
        assert!(broker.open(&credentials).await.is_ok());
        assert_eq!(broker.open_attempts(), 2);
        assert_eq!(broker.session_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_loops_back_to_subscribers() {
        let broker = MemoryBroker::new();
        let credentials = Credentials::plain("memory", 1883, "test");
        let mut opened = broker.open(&credentials).await.unwrap();

        opened.link.subscribe("fan/#").await.unwrap();
        opened.link.publish("fan/control", b"on".to_vec()).await.unwrap();

        match opened.events.recv().await.unwrap() {
            LinkEvent::Message(message) => assert_eq!(message.payload, b"on"),
            other => panic!("Expected message, got {other:?}"),
        }
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_link_rejects_operations() {
        let broker = MemoryBroker::new();
        let credentials = Credentials::plain("memory", 1883, "test");
        let opened = broker.open(&credentials).await.unwrap();

        opened.link.close().await;
        assert!(opened.link.subscribe("a").await.is_err());
        assert!(opened.link.publish("a", Vec::new()).await.is_err());
    }
}

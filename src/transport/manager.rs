//! Supervised broker session
//!
//! `ConnectionManager` owns the connection state and the subscription set.
//! A supervisor task forwards inbound messages to the router channel and
//! rebuilds the session when it drops: wait the reconnect interval, retry a
//! bounded number of times, resubscribe every known topic. When the attempts
//! run out the manager parks in `Disconnected` until `connect` is called
//! again.
//!
//! Shutdown is two-phase: `stop_intake` stops reading from the broker and
//! hands everything already received to the router, `disconnect` closes
//! the session.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::credentials::Credentials;
use super::error::{TransportError, TransportResult};
use super::link::{BrokerLink, Connector, InboundMessage, LinkEvent, OpenedLink};
use super::state::ConnectionState;
use crate::retry::RetryPolicy;

struct Supervision {
    cancel: CancellationToken,
    /// Child of `cancel`: stops reading without closing the session
    intake: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Supervision {
    fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && self.handle.as_ref().map_or(true, |h| !h.is_finished())
    }
}

/// Owns the broker session, its state and its subscriptions
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    state: watch::Sender<ConnectionState>,
    /// Topics to (re)subscribe on every session
    topics: RwLock<Vec<String>>,
    link: RwLock<Option<Arc<dyn BrokerLink>>>,
    inbound: mpsc::Sender<InboundMessage>,
    session: Mutex<Option<Supervision>>,
}

impl ConnectionManager {
    /// Create a manager and the channel the router consumes
    ///
    /// `policy` bounds every connection sequence: `max_attempts()` tries
    /// with `delay` between them.
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
        inbound_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<InboundMessage>) {
        let (inbound, rx) = mpsc::channel(inbound_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let manager = Arc::new(Self {
            connector,
            policy,
            state,
            topics: RwLock::new(Vec::new()),
            link: RwLock::new(None),
            inbound,
            session: Mutex::new(None),
        });
        (manager, rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Broker state changed");
        }
    }

    /// Establish the session and start supervising it
    ///
    /// Fails with `TransportError::Connection` once every attempt has
    /// failed. Calling it while a session is active or reconnecting is a
    /// no-op.
    pub async fn connect(self: &Arc<Self>, credentials: Credentials) -> TransportResult<()> {
        let cancel = {
            let mut session = self.session.lock().await;
            if session.as_ref().is_some_and(Supervision::is_active) {
                tracing::debug!("Broker session already active");
                return Ok(());
            }
            self.connector.verify(&credentials)?;

            let cancel = CancellationToken::new();
            *session = Some(Supervision {
                cancel: cancel.clone(),
                intake: cancel.child_token(),
                handle: None,
            });
            cancel
        };

        self.set_state(ConnectionState::Connecting);
        let opened = match self.open_with_retry(&credentials, &cancel).await {
            Ok(opened) => opened,
            Err(e) => {
                cancel.cancel();
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let OpenedLink { link, events } = opened;
        self.install(link).await;

        let mut session = self.session.lock().await;
        match session.as_mut() {
            Some(supervision) if !cancel.is_cancelled() => {
                let manager = Arc::clone(self);
                let intake = supervision.intake.clone();
                let supervisor_cancel = cancel.clone();
                supervision.handle = Some(tokio::spawn(async move {
                    manager
                        .supervise(credentials, events, supervisor_cancel, intake)
                        .await;
                }));
                Ok(())
            }
            // disconnect() ran while the session was being established
            _ => {
                drop(session);
                if let Some(link) = self.link.write().await.take() {
                    link.close().await;
                }
                self.set_state(ConnectionState::Disconnected);
                Err(TransportError::Cancelled)
            }
        }
    }

    async fn open_with_retry(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> TransportResult<OpenedLink> {
        let mut retry = self.policy.start();

        loop {
            let attempt = retry.failures() + 1;
            tracing::info!(
                host = %credentials.host,
                port = credentials.port,
                attempt,
                "Connecting to broker"
            );

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                result = self.connector.open(credentials) => result,
            };

            let err = match result {
                Ok(opened) => {
                    tracing::info!(host = %credentials.host, attempt, "Connected to broker");
                    return Ok(opened);
                }
                Err(e) => e,
            };

            match retry.record_failure() {
                Some(delay) => {
                    tracing::warn!(
                        error = %err,
                        attempt,
                        max_attempts = self.policy.max_attempts(),
                        "Broker connection failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    tracing::error!(
                        error = %err,
                        attempts = retry.failures(),
                        "Broker connection attempts exhausted"
                    );
                    return Err(TransportError::Connection {
                        attempts: retry.failures(),
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    /// Subscribe the new session to every known topic, then publish it
    async fn install(&self, link: Arc<dyn BrokerLink>) {
        let topics = self.topics.read().await;
        for topic in topics.iter() {
            if let Err(e) = link.subscribe(topic).await {
                tracing::error!(topic = %topic, error = %e, "Resubscribe failed");
            }
        }
        *self.link.write().await = Some(link);
        self.set_state(ConnectionState::Connected);
        tracing::debug!(topics = topics.len(), "Broker session installed");
    }

    async fn supervise(
        self: Arc<Self>,
        credentials: Credentials,
        mut events: mpsc::Receiver<LinkEvent>,
        cancel: CancellationToken,
        intake: CancellationToken,
    ) {
        loop {
            let reason = loop {
                tokio::select! {
                    _ = intake.cancelled() => {
                        if !cancel.is_cancelled() {
                            self.forward_remaining(&mut events).await;
                        }
                        return;
                    }
                    event = events.recv() => match event {
                        Some(LinkEvent::Message(message)) => self.forward(message).await,
                        Some(LinkEvent::Lost(reason)) => break reason,
                        None => break "event stream closed".to_string(),
                    }
                }
            };

            tracing::warn!(reason = %reason, "Broker session lost");
            if let Some(link) = self.link.write().await.take() {
                link.close().await;
            }
            self.set_state(ConnectionState::Offline);

            tokio::select! {
                _ = intake.cancelled() => return,
                _ = tokio::time::sleep(self.policy.delay) => {}
            }

            self.set_state(ConnectionState::Connecting);
            match self.open_with_retry(&credentials, &intake).await {
                Ok(opened) => {
                    self.install(opened.link).await;
                    events = opened.events;
                    tracing::info!("Broker session restored");
                }
                Err(TransportError::Cancelled) => return,
                Err(e) => {
                    tracing::error!(error = %e, "Giving up on broker until reconnected");
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    async fn forward(&self, message: InboundMessage) {
        let topic = message.topic.clone();
        if self.inbound.send(message).await.is_err() {
            tracing::warn!(topic = %topic, "Inbound channel closed, message discarded");
        }
    }

    /// Close the link's event stream and forward what it still holds
    async fn forward_remaining(&self, events: &mut mpsc::Receiver<LinkEvent>) {
        events.close();
        let mut forwarded = 0usize;
        while let Some(event) = events.recv().await {
            if let LinkEvent::Message(message) = event {
                self.forward(message).await;
                forwarded += 1;
            }
        }
        tracing::info!(forwarded, "Broker intake stopped");
    }

    /// Stop taking messages from the broker
    ///
    /// Every message already received is in the inbound channel when this
    /// returns. The session stays open for publishing until `disconnect`;
    /// a session lost afterwards is not rebuilt.
    pub async fn stop_intake(&self) {
        let mut session = self.session.lock().await;
        let Some(supervision) = session.as_mut() else {
            return;
        };
        supervision.intake.cancel();
        if let Some(handle) = supervision.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Broker supervisor failed");
            }
        }
    }

    /// Register interest in topics with at-least-once delivery
    ///
    /// Topics are remembered and resubscribed after every reconnect. While
    /// no session is open they are only remembered.
    pub async fn subscribe<I, S>(&self, topics: I) -> TransportResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut known = self.topics.write().await;
        let link = self.link.read().await.clone();

        for topic in topics {
            let topic = topic.into();
            if let Some(link) = &link {
                link.subscribe(&topic).await?;
                tracing::info!(topic = %topic, "Subscribed");
            }
            if !known.contains(&topic) {
                known.push(topic);
            }
        }
        Ok(())
    }

    pub async fn topics(&self) -> Vec<String> {
        self.topics.read().await.clone()
    }

    /// Send a payload on the current session
    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> TransportResult<()> {
        if !self.state().is_connected() {
            return Err(TransportError::NotConnected);
        }
        let link = self
            .link
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;

        link.publish(topic, payload.into()).await?;
        tracing::debug!(topic = %topic, "Published");
        Ok(())
    }

    /// Serialize a control command and publish it
    pub async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> TransportResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, payload).await
    }

    /// Close the session and stop supervising it
    pub async fn disconnect(&self) {
        let supervision = self.session.lock().await.take();
        if let Some(supervision) = supervision {
            supervision.cancel.cancel();
            if let Some(handle) = supervision.handle {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        tracing::error!(error = %e, "Broker supervisor failed");
                    }
                }
            }
        }

        if let Some(link) = self.link.write().await.take() {
            link.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Broker session closed");
    }
}

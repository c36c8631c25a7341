//! MQTT connector over rumqttc
//!
//! Each `open` builds a fresh `AsyncClient`/`EventLoop` pair, polls until the
//! broker acknowledges the connection, then hands the event loop to a pump
//! task. The pump never lets rumqttc reconnect on its own: on the first
//! error it reports the loss and exits, and the session manager decides
//! whether and when to open again.
//!
//! Acknowledgements are manual in both directions. An inbound PUBLISH is
//! acked only once it sits in the event channel, so a message the process
//! never took is redelivered by the broker. An outbound publish completes
//! when its PUBACK arrives, not when rumqttc queues it.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::credentials::Credentials;
use super::error::{TransportError, TransportResult};
use super::link::{BrokerLink, Connector, InboundMessage, LinkEvent, OpenedLink};

/// Opens TLS sessions to an MQTT broker
pub struct MqttConnector {
    /// Capacity of the rumqttc request queue and the event channel
    capacity: usize,
}

impl MqttConnector {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }

    fn options(&self, credentials: &Credentials) -> TransportResult<MqttOptions> {
        let mut options = MqttOptions::new(
            credentials.client_id.clone(),
            credentials.host.clone(),
            credentials.port,
        );
        options.set_keep_alive(credentials.keep_alive);
        options.set_clean_session(true);
        options.set_manual_acks(true);

        if let Some(username) = &credentials.username {
            options.set_credentials(
                username.clone(),
                credentials.password.clone().unwrap_or_default(),
            );
        }

        if let Some(tls) = credentials.load_tls()? {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: tls.ca,
                alpn: None,
                client_auth: Some((tls.cert, tls.key)),
            }));
        }

        Ok(options)
    }
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl Connector for MqttConnector {
    fn verify(&self, credentials: &Credentials) -> TransportResult<()> {
        credentials.verify()
    }

    async fn open(&self, credentials: &Credentials) -> TransportResult<OpenedLink> {
        let options = self.options(credentials)?;
        let (client, mut eventloop) = AsyncClient::new(options, self.capacity);

        tokio::time::timeout(credentials.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| {
                TransportError::Broker(format!(
                    "no CONNACK within {:?}",
                    credentials.connect_timeout
                ))
            })??;

        let (tx, rx) = mpsc::channel(self.capacity);
        let acks = Arc::new(PubAcks::default());
        let pump = tokio::spawn(pump(eventloop, client.clone(), tx, Arc::clone(&acks)));

        Ok(OpenedLink {
            link: Arc::new(MqttLink {
                client,
                acks,
                ack_timeout: credentials.connect_timeout,
                publishing: Mutex::new(()),
                pump: Mutex::new(Some(pump)),
            }),
            events: rx,
        })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> TransportResult<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(TransportError::Broker(format!(
                        "connection refused: {:?}",
                        code
                    ))),
                };
            }
            Ok(_) => {}
            Err(e) => return Err(TransportError::Broker(e.to_string())),
        }
    }
}

/// Matches outbound QoS 1 publishes with their PUBACK
///
/// rumqttc assigns packet ids as it sends, in request order. Waiters queue
/// in the same order and move to the in-flight map when their id is known.
#[derive(Default)]
struct PubAcks {
    queued: std::sync::Mutex<VecDeque<oneshot::Sender<()>>>,
    in_flight: std::sync::Mutex<HashMap<u16, oneshot::Sender<()>>>,
}

impl PubAcks {
    /// Register the next publish; resolves on its PUBACK
    fn expect(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        lock(&self.queued).push_back(tx);
        rx
    }

    /// The next queued publish went out as `pkid`
    fn sent(&self, pkid: u16) {
        if let Some(waiter) = lock(&self.queued).pop_front() {
            lock(&self.in_flight).insert(pkid, waiter);
        }
    }

    fn acked(&self, pkid: u16) {
        if let Some(waiter) = lock(&self.in_flight).remove(&pkid) {
            let _ = waiter.send(());
        }
    }

    /// Fail every waiter; the session is gone
    fn abandon(&self) {
        lock(&self.queued).clear();
        lock(&self.in_flight).clear();
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn pump(
    mut eventloop: EventLoop,
    client: AsyncClient,
    tx: mpsc::Sender<LinkEvent>,
    acks: Arc<PubAcks>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::new(publish.topic.clone(), publish.payload.to_vec());
                tracing::trace!(topic = %message.topic, bytes = message.payload.len(), "MQTT message");
                if tx.send(LinkEvent::Message(message)).await.is_err() {
                    // Not acked: the broker redelivers it to the next session
                    break;
                }
                if let Err(e) = client.try_ack(&publish) {
                    tracing::warn!(error = %e, topic = %publish.topic, "MQTT ack not queued");
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.sent(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.acked(ack.pkid),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = tx
                    .send(LinkEvent::Lost("broker sent DISCONNECT".to_string()))
                    .await;
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("MQTT client disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(LinkEvent::Lost(e.to_string())).await;
                break;
            }
        }
    }
    acks.abandon();
}

struct MqttLink {
    client: AsyncClient,
    acks: Arc<PubAcks>,
    ack_timeout: Duration,
    /// Keeps waiter order equal to request order
    publishing: Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn subscribe(&self, topic: &str) -> TransportResult<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()> {
        let failed = |reason: String| TransportError::Publish {
            topic: topic.to_string(),
            reason,
        };

        let acked = {
            let _order = self.publishing.lock().await;
            let acked = self.acks.expect();
            if let Err(e) = self
                .client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
            {
                // Drop the waiter that will never be sent
                lock(&self.acks.queued).pop_back();
                return Err(failed(e.to_string()));
            }
            acked
        };

        match tokio::time::timeout(self.ack_timeout, acked).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(failed("session closed before PUBACK".to_string())),
            Err(_) => Err(failed(format!("no PUBACK within {:?}", self.ack_timeout))),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!(error = %e, "MQTT disconnect request not queued");
        }
        if let Some(pump) = self.pump.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), pump).await;
        }
    }
}

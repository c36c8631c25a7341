//! Pipeline wiring
//!
//! Builds every component from [`Config`], starts them, and stops them in
//! dependency order:
//!
//! 1. stop broker intake; every received message is queued for the router
//! 2. stop the router once it has handled that queue
//! 3. drain the write buffer
//! 4. close the broker session
//! 5. wait for in-flight enrichment, then release the store

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::config::Config;
use crate::geo::{Enricher, EnrichmentError, GeoResolver, UnwiredLabsConfig, UnwiredLabsResolver};
use crate::ingest::{Deduplicator, MessageRouter};
use crate::notify::{HubConfig, NotificationHub};
use crate::storage::{BatchWriter, Event, EventStore, SqliteStore, StorageError};
use crate::transport::{
    ConnectionManager, Connector, Credentials, InboundMessage, MqttConnector, TransportError,
};

const ENRICHMENT_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Geolocation setup failed: {0}")]
    Enrichment(#[from] EnrichmentError),

    #[error("Pipeline already started")]
    AlreadyStarted,
}

/// Externally provided collaborators
pub struct Components {
    pub connector: Arc<dyn Connector>,
    pub store: Arc<dyn EventStore>,
    /// `None` disables location enrichment
    pub resolver: Option<Arc<dyn GeoResolver>>,
}

impl Components {
    /// MQTT, SQLite and Unwired Labs as configured
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let store = SqliteStore::open(&config.storage.resolved_path())?;

        let geo = &config.geolocation;
        let resolver: Option<Arc<dyn GeoResolver>> = if !geo.enabled {
            tracing::info!("Location enrichment disabled");
            None
        } else if geo.token.is_empty() {
            tracing::warn!("No geolocation token configured, location enrichment disabled");
            None
        } else {
            Some(Arc::new(UnwiredLabsResolver::new(UnwiredLabsConfig {
                url: geo.url.clone(),
                token: geo.token.clone(),
                timeout: Duration::from_millis(geo.timeout_ms),
            })?))
        };

        Ok(Self {
            connector: Arc::new(MqttConnector::new(config.broker.inbound_capacity)),
            store: Arc::new(store),
            resolver,
        })
    }
}

pub struct Pipeline {
    config: Config,
    store: Arc<dyn EventStore>,
    transport: Arc<ConnectionManager>,
    inbound: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    writer: Arc<BatchWriter>,
    hub: Arc<NotificationHub>,
    enricher: Option<Arc<Enricher>>,
    router: Arc<MessageRouter>,
    router_cancel: CancellationToken,
    router_task: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn build(config: Config) -> Result<Self, PipelineError> {
        let components = Components::from_config(&config)?;
        Ok(Self::build_with(config, components))
    }

    pub fn build_with(config: Config, components: Components) -> Self {
        let Components {
            connector,
            store,
            resolver,
        } = components;

        let (transport, inbound) = ConnectionManager::new(
            connector,
            config.broker.retry_policy(),
            config.broker.inbound_capacity,
        );

        let dedup = Arc::new(Deduplicator::new(
            Arc::clone(&store),
            config.dedup.recent_capacity,
        ));

        // A dropped batch must not block redelivery of its events
        let forget = Arc::clone(&dedup);
        let writer = Arc::new(
            BatchWriter::new(Arc::clone(&store), config.buffer.to_buffer_config()).with_drop_hook(
                Box::new(move |events: &[Event]| {
                    let identities: Vec<_> = events.iter().map(Event::identity).collect();
                    forget.forget(&identities);
                }),
            ),
        );

        let hub = Arc::new(NotificationHub::new(HubConfig {
            max_sessions: config.api.max_sessions,
            session_buffer: config.api.session_buffer,
        }));

        let enricher = resolver.map(|resolver| {
            Arc::new(Enricher::new(
                resolver,
                Arc::clone(&store),
                config.geolocation.max_concurrent,
            ))
        });

        let router = Arc::new(MessageRouter::new(
            config.topics.clone(),
            dedup,
            Arc::clone(&writer),
            Arc::clone(&store),
            hub.clone(),
            enricher.clone(),
        ));

        Self {
            config,
            store,
            transport,
            inbound: Mutex::new(Some(inbound)),
            writer,
            hub,
            enricher,
            router,
            router_cancel: CancellationToken::new(),
            router_task: Mutex::new(None),
        }
    }

    /// Start flushing and routing, then connect and subscribe
    pub async fn start(&self) -> Result<(), PipelineError> {
        let inbound = self
            .inbound
            .lock()
            .await
            .take()
            .ok_or(PipelineError::AlreadyStarted)?;

        self.writer.start().await;

        let router = Arc::clone(&self.router);
        let cancel = self.router_cancel.clone();
        *self.router_task.lock().await = Some(tokio::spawn(router.run(inbound, cancel)));

        self.transport.subscribe(self.config.topics.inbound()).await?;
        self.transport
            .connect(Credentials::from_config(&self.config.broker))
            .await?;

        tracing::info!(
            broker = %format!("{}:{}", self.config.broker.host, self.config.broker.port),
            "Pipeline started"
        );
        Ok(())
    }

    /// Stop everything in dependency order
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        tracing::info!("Pipeline shutting down");

        self.transport.stop_intake().await;
        self.router_cancel.cancel();
        if let Some(handle) = self.router_task.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Router task failed");
            }
        }

        self.writer.drain().await;
        self.transport.disconnect().await;

        if let Some(enricher) = &self.enricher {
            enricher.shutdown(ENRICHMENT_GRACE).await;
        }

        self.store.close().await?;
        tracing::info!("Pipeline stopped");
        Ok(())
    }

    /// Send a control message to the devices
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), PipelineError> {
        Ok(self.transport.publish(topic, payload).await?)
    }

    /// Shared state for the observer API
    pub fn app_state(&self) -> AppState {
        AppState::new(
            Arc::clone(&self.hub),
            Arc::clone(&self.transport),
            Arc::clone(&self.writer),
        )
        .with_router(Arc::clone(&self.router))
    }

    pub fn transport(&self) -> &Arc<ConnectionManager> {
        &self.transport
    }

    pub fn writer(&self) -> &Arc<BatchWriter> {
        &self.writer
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EventIdentity, FlushOutcome};
    use crate::testing::StaticResolver;
    use crate::transport::{ConnectionState, MemoryBroker};
    use serde_json::{json, Value};
    use tempfile::tempdir;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.broker.reconnect_interval_ms = 10;
        config.buffer.flush_interval_ms = 60_000;
        config
    }

    fn build(
        broker: &MemoryBroker,
        store: Arc<SqliteStore>,
        resolver: Option<Arc<dyn GeoResolver>>,
    ) -> Pipeline {
        Pipeline::build_with(
            test_config(),
            Components {
                connector: Arc::new(broker.clone()),
                store,
                resolver,
            },
        )
    }

    async fn wait_for_appended(pipeline: &Pipeline, count: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.writer().stats().await.appended < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("events never reached the buffer");
    }

    #[tokio::test]
    async fn test_alert_reaches_store_and_observers() {
        let broker = MemoryBroker::new();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let pipeline = build(&broker, Arc::clone(&store), None);

        let (_, mut rx1) = pipeline.hub().register().await.unwrap();
        let (_, mut rx2) = pipeline.hub().register().await.unwrap();

        pipeline.start().await.unwrap();
        assert_eq!(pipeline.transport().state(), ConnectionState::Connected);

        let payload = json!({"ID": 1, "DEVICE_ID": 100000, "TS": 1000, "Type": 6, "Details": {}});
        assert_eq!(broker.inject("apm/server", payload.to_string()).await, 1);
        // Retransmission of the same event
        broker.inject("apm/server", payload.to_string()).await;

        wait_for_appended(&pipeline, 1).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.router().stats().duplicates < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        match pipeline.writer().flush().await {
            FlushOutcome::Written(report) => assert_eq!(report.inserted, 1),
            other => panic!("unexpected flush outcome: {:?}", other),
        }

        assert_eq!(store.count_events().await.unwrap(), 1);
        let stored = store
            .get_event(EventIdentity::new(100000, 1, 1000))
            .await
            .unwrap()
            .unwrap();
        assert!(stored.alert);

        for rx in [&mut rx1, &mut rx2] {
            let frame = rx.recv().await.unwrap();
            let observed: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(observed["ID"], 1);
            assert_eq!(observed["DEVICE_ID"], 100000);
            assert_eq!(observed["Alert"], true);
            // Duplicate was not fanned out again
            assert!(rx.try_recv().is_err());
        }

        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.db");

        let broker = MemoryBroker::new();
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let pipeline = build(&broker, store, None);
        pipeline.start().await.unwrap();

        for seq in 1..=3 {
            let payload = json!({"ID": seq, "DEVICE_ID": 7, "TS": 1000 + seq, "Type": 20});
            broker.inject("apm/server", payload.to_string()).await;
        }
        wait_for_appended(&pipeline, 3).await;
        assert_eq!(pipeline.writer().stats().await.pending, 3);

        pipeline.shutdown().await.unwrap();

        assert_eq!(pipeline.transport().state(), ConnectionState::Disconnected);
        assert_eq!(broker.session_count(), 0);
        assert!(pipeline
            .writer()
            .append(crate::testing::sample_event(7, 9, 20))
            .await
            .is_err());

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.count_events().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_persists_every_delivered_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.db");

        let broker = MemoryBroker::new();
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let pipeline = build(&broker, store, None);
        pipeline.start().await.unwrap();

        let mut delivered = 0;
        for seq in 1..=20 {
            let payload = json!({"ID": seq, "DEVICE_ID": 9, "TS": 2000 + seq, "Type": 20});
            delivered += broker.inject("apm/server", payload.to_string()).await;
        }
        assert_eq!(delivered, 20);

        // No waiting: most events are still queued in the transport
        pipeline.shutdown().await.unwrap();

        let stats = pipeline.writer().stats().await;
        assert_eq!(stats.appended, 20);
        assert_eq!(stats.flushed, 20);
        assert_eq!(stats.pending, 0);

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.count_events().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_location_event_enriched() {
        let broker = MemoryBroker::new();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let resolver = Arc::new(StaticResolver::ok(19.07, 72.87));
        let pipeline = build(
            &broker,
            Arc::clone(&store),
            Some(resolver.clone() as Arc<dyn GeoResolver>),
        );
        pipeline.start().await.unwrap();

        let payload = json!({
            "ID": 3, "DEVICE_ID": 42, "TS": 1000, "Type": 1,
            "Details": {"cell_info": {"cell_towers": {"mcc": 404, "mnc": 45, "lac": 1234, "cid": 56789}}}
        });
        broker.inject("apm/server", payload.to_string()).await;
        wait_for_appended(&pipeline, 1).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get_location(42).await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let location = store.get_location(42).await.unwrap().unwrap();
        assert_eq!(location.latitude, 19.07);
        assert_eq!(resolver.calls(), 1);

        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let broker = MemoryBroker::new();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let pipeline = build(&broker, store, None);

        pipeline.start().await.unwrap();
        assert!(matches!(
            pipeline.start().await,
            Err(PipelineError::AlreadyStarted)
        ));
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_control_message() {
        let broker = MemoryBroker::new();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let pipeline = build(&broker, store, None);

        assert!(matches!(
            pipeline.publish("fan/control", "on").await,
            Err(PipelineError::Transport(TransportError::NotConnected))
        ));

        pipeline.start().await.unwrap();
        pipeline.publish("fan/control", "on").await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "fan/control");

        pipeline.shutdown().await.unwrap();
    }
}

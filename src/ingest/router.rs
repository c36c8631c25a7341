//! Message router
//!
//! Consumes inbound broker messages one at a time and dispatches them by
//! topic:
//!
//! ```text
//! events topic ─▶ normalize ─▶ dedup ─▶ alert? broadcast ─▶ location? enrich ─▶ buffer
//! config / sensor / feedback ─▶ DeviceRecord ─▶ store
//! ```
//!
//! Every failure stays inside the router: it is logged and the next message
//! is processed.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use super::dedup::{Deduplicator, Verdict};
use super::error::IngestError;
use super::event_type::LOCATION;
use super::normalizer::{normalize_event, normalize_record};
use crate::config::TopicsConfig;
use crate::geo::Enricher;
use crate::notify::Notifier;
use crate::storage::{AppendOutcome, BatchWriter, EventIdentity, EventStore, RecordKind};
use crate::transport::InboundMessage;

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Event handed to the write buffer
    Accepted {
        identity: EventIdentity,
        alert: bool,
        buffer: AppendOutcome,
    },
    /// Event seen before; discarded
    Duplicate(Verdict),
    /// Auxiliary record written
    Recorded(RecordKind),
}

/// Counters exposed on the health endpoint
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RouterStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub alerts: u64,
    pub records: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    duplicates: AtomicU64,
    alerts: AtomicU64,
    records: AtomicU64,
    rejected: AtomicU64,
}

pub struct MessageRouter {
    topics: TopicsConfig,
    dedup: Arc<Deduplicator>,
    writer: Arc<BatchWriter>,
    store: Arc<dyn EventStore>,
    notifier: Arc<dyn Notifier>,
    enricher: Option<Arc<Enricher>>,
    counters: Counters,
}

impl MessageRouter {
    pub fn new(
        topics: TopicsConfig,
        dedup: Arc<Deduplicator>,
        writer: Arc<BatchWriter>,
        store: Arc<dyn EventStore>,
        notifier: Arc<dyn Notifier>,
        enricher: Option<Arc<Enricher>>,
    ) -> Self {
        Self {
            topics,
            dedup,
            writer,
            store,
            notifier,
            enricher,
            counters: Counters::default(),
        }
    }

    /// Process one message
    pub async fn route(&self, message: &InboundMessage) -> Result<RouteOutcome, IngestError> {
        let topic = message.topic.as_str();

        if topic == self.topics.events {
            return self.route_event(&message.payload).await;
        }

        let kind = if topic == self.topics.config {
            RecordKind::Config
        } else if topic == self.topics.sensor {
            RecordKind::Sensor
        } else if topic == self.topics.feedback {
            RecordKind::Feedback
        } else {
            return Err(IngestError::UnknownTopic(topic.to_string()));
        };
        self.route_record(kind, &message.payload).await
    }

    async fn route_event(&self, payload: &[u8]) -> Result<RouteOutcome, IngestError> {
        let event = normalize_event(payload, Utc::now())?;
        let identity = event.identity();
        tracing::Span::current().record("device_id", event.device_id);

        let verdict = self.dedup.check(identity).await;
        if !verdict.is_fresh() {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(RouteOutcome::Duplicate(verdict));
        }

        // Observers hear about alerts whatever happens to the write
        let alert = event.alert;
        if alert {
            self.counters.alerts.fetch_add(1, Ordering::Relaxed);
            let observers = self.notifier.broadcast(&event).await;
            tracing::info!(
                identity = %identity,
                event = %event.name,
                observers,
                "Alert received"
            );
        }

        if event.type_code == LOCATION {
            if let Some(enricher) = &self.enricher {
                enricher.submit(&event);
            }
        }

        let buffer = match self.writer.append(event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.dedup.forget([&identity]);
                return Err(IngestError::Storage(e.to_string()));
            }
        };

        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(identity = %identity, "Event accepted");
        Ok(RouteOutcome::Accepted {
            identity,
            alert,
            buffer,
        })
    }

    async fn route_record(
        &self,
        kind: RecordKind,
        payload: &[u8],
    ) -> Result<RouteOutcome, IngestError> {
        let record = normalize_record(kind, payload, Utc::now())?;
        tracing::Span::current().record("device_id", record.device_id);

        self.store
            .append_record(&record)
            .await
            .map_err(|e| IngestError::Storage(e.to_string()))?;

        self.counters.records.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(kind = kind.as_str(), "Device record stored");
        Ok(RouteOutcome::Recorded(kind))
    }

    /// Route a message, logging instead of returning failures
    pub async fn handle(&self, message: InboundMessage) {
        let span = info_span!(
            "inbound_message",
            topic = %message.topic,
            payload_size = message.payload.len(),
            device_id = tracing::field::Empty,
        );

        async {
            if let Err(e) = self.route(&message).await {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                match e {
                    IngestError::Storage(_) => tracing::error!(error = %e, "Message not stored"),
                    _ => tracing::warn!(error = %e, "Message dropped"),
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Consume the inbound channel until cancelled or closed
    ///
    /// Cancellation closes the channel to new messages; whatever is already
    /// queued is still handled before returning.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMessage>,
        cancel: CancellationToken,
    ) {
        tracing::info!(topics = ?self.topics.inbound(), "Router started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
            }
        }

        inbound.close();
        let mut drained = 0u64;
        while let Some(message) = inbound.recv().await {
            self.handle(message).await;
            drained += 1;
        }

        tracing::info!(drained, "Router stopped");
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            alerts: self.counters.alerts.load(Ordering::Relaxed),
            records: self.counters.records.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

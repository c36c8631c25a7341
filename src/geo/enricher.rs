//! Location enrichment off the ingestion path
//!
//! Lookups run as tracked tasks, at most `max_concurrent` at a time. When
//! every slot is busy a new lookup is skipped rather than queued; the
//! device reports its tower again later. A failed lookup is logged and
//! forgotten; it never affects persistence of the event that carried it.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use super::client::{CellTower, EnrichmentError, GeoResolver};
use crate::storage::{DeviceLocation, Event, EventStore};

pub struct Enricher {
    resolver: Arc<dyn GeoResolver>,
    store: Arc<dyn EventStore>,
    limit: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Enricher {
    pub fn new(
        resolver: Arc<dyn GeoResolver>,
        store: Arc<dyn EventStore>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            resolver,
            store,
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Schedule a lookup for a location event
    ///
    /// Returns false when the event carries no usable cell tower, every
    /// lookup slot is taken, or the enricher is shutting down.
    pub fn submit(&self, event: &Event) -> bool {
        if self.tracker.is_closed() {
            return false;
        }
        let Some(tower) = CellTower::from_details(&event.details) else {
            tracing::debug!(device_id = event.device_id, "Location event without cell tower");
            return false;
        };

        let Ok(permit) = Arc::clone(&self.limit).try_acquire_owned() else {
            tracing::warn!(device_id = event.device_id, "Lookup slots busy, location skipped");
            return false;
        };

        let device_id = event.device_id;
        let resolver = Arc::clone(&self.resolver);
        let store = Arc::clone(&self.store);

        self.tracker.spawn(async move {
            let _permit = permit;
            match enrich(resolver.as_ref(), store.as_ref(), device_id, &tower).await {
                Ok(location) => tracing::info!(
                    device_id,
                    latitude = location.latitude,
                    longitude = location.longitude,
                    "Device location updated"
                ),
                Err(e) => tracing::warn!(device_id, error = %e, "Location enrichment failed"),
            }
        });
        true
    }

    /// Stop accepting lookups and wait for the running ones
    pub async fn shutdown(&self, timeout: Duration) {
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                pending = self.tracker.len(),
                "Enrichment still running at shutdown"
            );
        }
    }
}

/// Resolve a tower and upsert the device location
pub async fn enrich(
    resolver: &dyn GeoResolver,
    store: &dyn EventStore,
    device_id: i64,
    tower: &CellTower,
) -> Result<DeviceLocation, EnrichmentError> {
    let fix = resolver.resolve(tower).await?;
    let location = DeviceLocation {
        device_id,
        latitude: fix.latitude,
        longitude: fix.longitude,
        accuracy: fix.accuracy,
        address: fix.address,
        last_updated: Utc::now(),
    };
    store.upsert_location(&location).await?;
    Ok(location)
}

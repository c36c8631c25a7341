//! Shared test fixtures

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::geo::{CellTower, EnrichmentError, GeoFix, GeoResolver};
use crate::ingest::{event_name, is_alert};
use crate::notify::Notifier;
use crate::storage::{
    DeviceLocation, DeviceRecord, Event, EventIdentity, EventStore, InsertReport, SqliteStore,
    StorageError, StorageResult,
};

pub fn sample_event(device_id: i64, sequence_id: i64, type_code: i64) -> Event {
    Event {
        sequence_id,
        device_id,
        device_ts: 1_699_000_000 + sequence_id,
        type_code,
        name: event_name(type_code).to_string(),
        details: json!({}),
        alert: is_alert(type_code),
        received_at: Utc::now(),
    }
}

pub fn location_event(device_id: i64, sequence_id: i64) -> Event {
    Event {
        details: json!({
            "cell_info": {"cell_towers": {"mcc": 404, "mnc": 45, "lac": 1234, "cid": 56789}}
        }),
        ..sample_event(device_id, sequence_id, 1)
    }
}

/// SQLite store that fails the first `n` calls
pub struct FlakyStore {
    inner: SqliteStore,
    failures_left: AtomicU32,
    attempts: Mutex<Vec<Vec<EventIdentity>>>,
}

impl FlakyStore {
    pub fn failing_first(n: u32) -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            failures_left: AtomicU32::new(n),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    pub fn inner(&self) -> &SqliteStore {
        &self.inner
    }

    /// Batches passed to `insert_events`, in call order
    pub fn insert_attempts(&self) -> Vec<Vec<EventIdentity>> {
        self.attempts.lock().unwrap().clone()
    }

    fn trip(&self) -> StorageResult<()> {
        let tripped = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated store outage",
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EventStore for FlakyStore {
    async fn insert_events(&self, events: &[Event]) -> StorageResult<InsertReport> {
        self.attempts
            .lock()
            .unwrap()
            .push(events.iter().map(Event::identity).collect());
        self.trip()?;
        self.inner.insert_events(events).await
    }

    async fn contains_event(&self, identity: &EventIdentity) -> StorageResult<bool> {
        self.trip()?;
        self.inner.contains_event(identity).await
    }

    async fn upsert_location(&self, location: &DeviceLocation) -> StorageResult<()> {
        self.trip()?;
        self.inner.upsert_location(location).await
    }

    async fn append_record(&self, record: &DeviceRecord) -> StorageResult<()> {
        self.trip()?;
        self.inner.append_record(record).await
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }
}

/// Notifier that remembers every broadcast
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn broadcast(&self, event: &Event) -> usize {
        self.events.lock().unwrap().push(event.clone());
        1
    }
}

/// Resolver returning a fixed answer
pub struct StaticResolver {
    fix: Option<GeoFix>,
    calls: AtomicUsize,
}

impl StaticResolver {
    pub fn ok(latitude: f64, longitude: f64) -> Self {
        Self {
            fix: Some(GeoFix {
                latitude,
                longitude,
                accuracy: Some(500.0),
                address: Some("Test Address".to_string()),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fix: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeoResolver for StaticResolver {
    async fn resolve(&self, _tower: &CellTower) -> Result<GeoFix, EnrichmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fix
            .clone()
            .ok_or_else(|| EnrichmentError::Rejected("No matches found".to_string()))
    }
}

//! Persistence interface consumed by the pipeline

use async_trait::async_trait;

use super::error::StorageResult;
use super::types::{DeviceLocation, DeviceRecord, Event, EventIdentity, InsertReport};

/// Durable store for events, locations and auxiliary records
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Bulk insert-if-absent keyed by the identity triple.
    ///
    /// Existing identities are skipped, never overwritten.
    async fn insert_events(&self, events: &[Event]) -> StorageResult<InsertReport>;

    /// Whether an event with this identity was already persisted
    async fn contains_event(&self, identity: &EventIdentity) -> StorageResult<bool>;

    /// Insert or replace the location row for a device
    async fn upsert_location(&self, location: &DeviceLocation) -> StorageResult<()>;

    async fn append_record(&self, record: &DeviceRecord) -> StorageResult<()>;

    /// Release the underlying handle; later calls fail with `Closed`
    async fn close(&self) -> StorageResult<()>;
}

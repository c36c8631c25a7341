//! Meterline Persistence
//!
//! - **types**: Core data structures (Event, EventIdentity, DeviceLocation, DeviceRecord)
//! - **store**: The `EventStore` interface the pipeline writes through
//! - **sqlite**: SQLite implementation with a uniqueness constraint on the identity triple
//! - **buffer**: Batch write buffer with bounded retry
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Router → BatchWriter (pending batch) → flush → EventStore::insert_events
//! Enricher → EventStore::upsert_location
//! Router (aux streams) → EventStore::append_record
//! ```

pub mod buffer;
pub mod error;
pub mod sqlite;
pub mod store;
pub mod types;

pub use buffer::{AppendOutcome, BatchWriter, BufferConfig, BufferStats, DropHook, FlushOutcome};
pub use error::{StorageError, StorageResult};
pub use sqlite::SqliteStore;
pub use store::EventStore;
pub use types::{DeviceLocation, DeviceRecord, Event, EventIdentity, InsertReport, RecordKind};

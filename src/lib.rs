//! # Meterline
//!
//! Field-device telemetry ingestion and alerting: a resilient MQTT session
//! feeds a router that validates device events, suppresses retransmissions,
//! persists them in batches, fans alerts out to WebSocket observers and
//! resolves cell-tower locations.
//!
//! ## Modules
//!
//! - [`transport`]: Broker session with reconnect and resubscribe
//! - [`ingest`]: Topic router, normalizer and deduplicator
//! - [`storage`]: SQLite event store and batch write buffer
//! - [`notify`]: Alert fan-out to observer sessions
//! - [`geo`]: Cell-tower geolocation enrichment
//! - [`api`]: Axum server for `/ws` and health probes
//! - [`pipeline`]: Wiring and ordered shutdown
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meterline::{Config, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::build(Config::load_default())?;
//!     pipeline.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!
//!     pipeline.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod geo;
pub mod ingest;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod retry;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export top-level types for convenience
pub use config::{generate_default_config, Config, ConfigError};

pub use pipeline::{Components, Pipeline, PipelineError};

pub use storage::{
    BatchWriter, BufferConfig, BufferStats, Event, EventIdentity, EventStore, SqliteStore,
    StorageError, StorageResult,
};

pub use ingest::{IngestError, MessageRouter};

pub use transport::{ConnectionManager, ConnectionState, Credentials, TransportError};

pub use notify::{NotificationHub, Notifier};

pub use api::{build_router, serve, ApiError, AppState};

//! Application State
//!
//! Shared state accessible by all API handlers.

use std::sync::Arc;
use std::time::Instant;

use crate::ingest::MessageRouter;
use crate::notify::NotificationHub;
use crate::storage::BatchWriter;
use crate::transport::ConnectionManager;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Observer sessions for alert fan-out
    pub hub: Arc<NotificationHub>,
    /// Broker connection, for readiness
    pub transport: Arc<ConnectionManager>,
    /// Write buffer, for health counters
    pub writer: Arc<BatchWriter>,
    /// Absent until the pipeline has started routing
    pub router: Option<Arc<MessageRouter>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        hub: Arc<NotificationHub>,
        transport: Arc<ConnectionManager>,
        writer: Arc<BatchWriter>,
    ) -> Self {
        Self {
            hub,
            transport,
            writer,
            router: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_router(mut self, router: Arc<MessageRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

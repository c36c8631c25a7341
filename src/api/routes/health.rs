//! Health Routes
//!
//! - GET /health/live - Liveness probe (process is alive)
//! - GET /health/ready - Readiness probe (broker session established)
//! - GET /health - Full health status

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::api::state::AppState;
use crate::ingest::RouterStats;
use crate::storage::BufferStats;
use crate::transport::ConnectionState;

/// Full health status
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status: healthy, degraded, unhealthy
    pub status: String,
    /// Broker session state
    pub broker: String,
    /// Connected observers
    pub sessions: usize,
    pub buffer: BufferStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router: Option<RouterStats>,
    pub uptime_seconds: u64,
    pub version: String,
}

/// GET /health/live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
///
/// 200 only while the broker session is up.
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.transport.state().is_connected() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /health
pub async fn full_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let broker = state.transport.state();

    let status = match broker {
        ConnectionState::Connected => "healthy",
        ConnectionState::Connecting | ConnectionState::Offline => "degraded",
        ConnectionState::Disconnected => "unhealthy",
    };

    Json(HealthResponse {
        status: status.to_string(),
        broker: broker.as_str().to_string(),
        sessions: state.hub.session_count().await,
        buffer: state.writer.stats().await,
        router: state.router.as_ref().map(|router| router.stats()),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::build_router;
    use crate::config::ApiConfig;
    use crate::notify::{HubConfig, NotificationHub};
    use crate::retry::RetryPolicy;
    use crate::storage::{BatchWriter, BufferConfig, SqliteStore};
    use crate::transport::{ConnectionManager, Credentials, InboundMessage, MemoryBroker};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        Router,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::util::ServiceExt;

    struct TestApp {
        state: AppState,
        _inbound: mpsc::Receiver<InboundMessage>,
    }

    fn create_test_app() -> TestApp {
        let broker = MemoryBroker::new();
        let (transport, inbound) =
            ConnectionManager::new(Arc::new(broker), RetryPolicy::new(0, Duration::ZERO), 16);
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let writer = Arc::new(BatchWriter::new(store, BufferConfig::default()));
        let hub = Arc::new(NotificationHub::new(HubConfig::default()));

        TestApp {
            state: AppState::new(hub, transport, writer),
            _inbound: inbound,
        }
    }

    fn router(app: &TestApp) -> Router {
        build_router(app.state.clone(), &ApiConfig::default()).unwrap()
    }

    async fn get(router: Router, uri: &str) -> axum::response::Response {
        router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_liveness() {
        let app = create_test_app();
        let response = get(router(&app), "/health/live").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_follows_broker() {
        let app = create_test_app();

        let response = get(router(&app), "/health/ready").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        app.state
            .transport
            .connect(Credentials::plain("memory", 1883, "health-test"))
            .await
            .unwrap();

        let response = get(router(&app), "/health/ready").await;
        assert_eq!(response.status(), StatusCode::OK);

        app.state.transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_full_health() {
        let app = create_test_app();
        let response = get(router(&app), "/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(health["status"], "unhealthy");
        assert_eq!(health["broker"], "disconnected");
        assert_eq!(health["sessions"], 0);
        assert_eq!(health["buffer"]["pending"], 0);
        assert!(health.get("router").is_none());
    }
}

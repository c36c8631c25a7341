//! Observer HTTP API
//!
//! Axum server carrying the alert WebSocket and the health probes.
//!
//! # Endpoints
//!
//! ## WebSocket
//! - `GET /ws` - Alert stream
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{http::HeaderValue, routing::get, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::config::ApiConfig;
use crate::notify::alert_stream;

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState, config: &ApiConfig) -> ApiResult<Router> {
    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    let shared_state = Arc::new(state);

    Ok(Router::new()
        .route("/ws", get(alert_stream))
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.cors_origins)?)
        .with_state(shared_state))
}

/// Permissive when no origins are configured
fn cors_layer(origins: &[String]) -> ApiResult<CorsLayer> {
    if origins.is_empty() {
        return Ok(CorsLayer::permissive());
    }

    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|_| ApiError::InvalidOrigin(origin.clone()))
        })
        .collect::<ApiResult<Vec<_>>>()?;

    Ok(CorsLayer::new().allow_origin(AllowOrigin::list(origins)))
}

/// Serve until `shutdown` is cancelled
pub async fn serve(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> ApiResult<()> {
    let router = build_router(state, config)?;

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ApiError::Bind {
            addr: addr.clone(),
            source,
        })?;

    tracing::info!("Meterline API listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Meterline API shut down gracefully");
    Ok(())
}

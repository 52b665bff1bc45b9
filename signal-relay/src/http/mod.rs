//! HTTP endpoints for signal-relay.
//!
//! Serves the WebSocket upgrade alongside health, stats and metrics on one
//! listener.

pub mod health;
mod metrics;
mod stats;

use crate::config::CorsConfig;
use crate::server::RelayHandle;
use crate::transport::websocket::ws_handler;
use axum::http::HeaderValue;
use axum::{routing::get, Extension, Router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: RelayHandle) -> Router {
    let cors = cors_layer(&relay.config().cors);

    let api = Router::new()
        .route("/health", get(health::health_handler))
        .route("/stats", get(stats::stats_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(cors);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/", get(ws_handler))
        .merge(api)
        .layer(Extension(relay))
}

/// CORS for the JSON endpoints, from the same origin patterns the
/// WebSocket upgrade checks.
fn cors_layer(config: &CorsConfig) -> CorsLayer {
    if config.origins.iter().any(|o| o == "*") {
        return CorsLayer::new().allow_origin(Any).allow_methods(Any);
    }

    let config = config.clone();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _request| {
                origin.to_str().map(|o| config.allows(o)).unwrap_or(false)
            },
        ))
        .allow_methods(Any)
}

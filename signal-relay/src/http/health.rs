//! Health check endpoint.

use crate::server::RelayHandle;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Serialize;

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Number of sessions.
    pub sessions: usize,
    /// Number of connected clients.
    pub clients: usize,
    /// Uptime in seconds.
    pub uptime: u64,
}

/// Health check handler.
///
/// Answers 503 once the event loop has stopped.
pub async fn health_handler(
    Extension(relay): Extension<RelayHandle>,
) -> (StatusCode, Json<HealthStatus>) {
    let version = env!("CARGO_PKG_VERSION").to_string();

    match relay.stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(HealthStatus {
                status: "ok".to_string(),
                version,
                sessions: stats.sessions,
                clients: stats.clients,
                uptime: stats.uptime,
            }),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus {
                status: "stopped".to_string(),
                version,
                sessions: 0,
                clients: 0,
                uptime: relay.uptime(),
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::SignalRelay;

    #[test]
    fn health_status_serializes() {
        let status = HealthStatus {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            sessions: 3,
            clients: 42,
            uptime: 3600,
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"clients\":42"));
    }

    #[tokio::test]
    async fn stopped_relay_reports_unavailable() {
        let (relay, _task) = SignalRelay::spawn(Config::default());
        relay.shutdown().await.unwrap();

        let (status, Json(body)) = health_handler(Extension(relay)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.status, "stopped");
    }
}

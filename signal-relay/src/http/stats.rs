//! Statistics endpoint.

use crate::server::{RelayHandle, RelayStats};
use axum::http::StatusCode;
use axum::{Extension, Json};

/// `GET /stats`: registry counts, uptime and a timestamp.
pub async fn stats_handler(
    Extension(relay): Extension<RelayHandle>,
) -> Result<Json<RelayStats>, StatusCode> {
    relay
        .stats()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::SignalRelay;
    use crate::transport::MockHandle;
    use signal_types::ConnectionId;
    use std::sync::Arc;

    #[tokio::test]
    async fn reports_connected_clients() {
        let (relay, _task) = SignalRelay::spawn(Config::default());
        relay
            .connected(ConnectionId::new(), Arc::new(MockHandle::new()))
            .await
            .unwrap();

        let Json(stats) = stats_handler(Extension(relay)).await.unwrap();
        assert_eq!(stats.clients, 1);
        assert_eq!(stats.active_clients, 1);
        assert_eq!(stats.sessions, 0);
    }
}

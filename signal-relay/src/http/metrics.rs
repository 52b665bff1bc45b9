//! Prometheus metrics endpoint.

use crate::server::RelayHandle;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;

/// Prometheus metrics handler.
///
/// Gauges come from a stats snapshot (zero if the relay has stopped);
/// counters are monotonic since startup.
pub async fn metrics_handler(Extension(relay): Extension<RelayHandle>) -> impl IntoResponse {
    let m = relay.metrics();

    // Gauges
    let stats = relay.stats().await.ok();
    let sessions = stats.as_ref().map_or(0, |s| s.sessions);
    let clients = stats.as_ref().map_or(0, |s| s.clients);
    let active_sessions = stats.as_ref().map_or(0, |s| s.active_sessions);
    let active_clients = stats.as_ref().map_or(0, |s| s.active_clients);
    let uptime = relay.uptime();

    // Counters
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let messages = m.messages_total.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let created = m.sessions_created.load(Ordering::Relaxed);
    let expired = m.sessions_expired.load(Ordering::Relaxed);
    let reaped = m.connections_reaped.load(Ordering::Relaxed);

    let body = format!(
        r#"# HELP signal_relay_sessions Sessions in the registry
# TYPE signal_relay_sessions gauge
signal_relay_sessions {sessions}

# HELP signal_relay_clients Connected clients
# TYPE signal_relay_clients gauge
signal_relay_clients {clients}

# HELP signal_relay_sessions_active Sessions active within the session timeout
# TYPE signal_relay_sessions_active gauge
signal_relay_sessions_active {active_sessions}

# HELP signal_relay_clients_active Clients seen within the client timeout
# TYPE signal_relay_clients_active gauge
signal_relay_clients_active {active_clients}

# HELP signal_relay_uptime_seconds Seconds since start
# TYPE signal_relay_uptime_seconds gauge
signal_relay_uptime_seconds {uptime}

# HELP signal_relay_info Server information
# TYPE signal_relay_info gauge
signal_relay_info{{version="{version}"}} 1

# HELP signal_relay_connections_total Total connections accepted
# TYPE signal_relay_connections_total counter
signal_relay_connections_total {conns_total}

# HELP signal_relay_messages_total Total inbound messages handled
# TYPE signal_relay_messages_total counter
signal_relay_messages_total {messages}

# HELP signal_relay_errors_total Total protocol errors
# TYPE signal_relay_errors_total counter
signal_relay_errors_total {errors}

# HELP signal_relay_rate_limit_hits_total Total rate limit rejections
# TYPE signal_relay_rate_limit_hits_total counter
signal_relay_rate_limit_hits_total {rate_limits}

# HELP signal_relay_sessions_created_total Total sessions created
# TYPE signal_relay_sessions_created_total counter
signal_relay_sessions_created_total {created}

# HELP signal_relay_sessions_expired_total Total sessions expired by the reaper
# TYPE signal_relay_sessions_expired_total counter
signal_relay_sessions_expired_total {expired}

# HELP signal_relay_connections_reaped_total Total silent connections evicted
# TYPE signal_relay_connections_reaped_total counter
signal_relay_connections_reaped_total {reaped}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::SignalRelay;
    use axum::body::to_bytes;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn exposes_counters_and_gauges() {
        let (relay, _task) = SignalRelay::spawn(Config::default());
        relay
            .metrics()
            .rate_limit_hits
            .fetch_add(3, Ordering::Relaxed);

        let response = metrics_handler(Extension(relay)).await.into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains("# TYPE signal_relay_sessions gauge"));
        assert!(text.contains("signal_relay_clients 0"));
        assert!(text.contains("signal_relay_rate_limit_hits_total 3"));
    }
}

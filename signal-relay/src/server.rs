//! Main SignalRelay event loop.
//!
//! One task owns the [`Registry`], the [`Router`] and the [`RateLimits`].
//! Sockets, timers and HTTP handlers talk to it only through a
//! [`RelayHandle`], so every mutation runs to completion before the next
//! event is looked at.

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::limits::{RateLimitError, RateLimits};
use crate::reaper;
use crate::registry::{Registry, Timeouts};
use crate::router::Router;
use crate::transport::{ConnectionHandle, CLOSE_GOING_AWAY};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use signal_types::{ConnectionId, ProtocolError, ServerMessage};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Capacity of the event channel. Socket readers wait when it is full.
const EVENT_QUEUE: usize = 1024;

/// Close reason sent to every connection on shutdown.
pub const SHUTDOWN_REASON: &str = "Server shutting down";

/// Operational metrics for monitoring relay activity.
///
/// Counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total connections accepted.
    pub connections_total: AtomicU64,
    /// Total inbound frames dispatched.
    pub messages_total: AtomicU64,
    /// Total protocol errors returned to clients.
    pub errors_total: AtomicU64,
    /// Total frames dropped by the rate limiter.
    pub rate_limit_hits: AtomicU64,
    /// Total sessions created by host registration.
    pub sessions_created: AtomicU64,
    /// Total sessions removed by the reaper.
    pub sessions_expired: AtomicU64,
    /// Total connections evicted by the reaper.
    pub connections_reaped: AtomicU64,
    /// Connections currently registered. Updated by the event loop.
    pub connections_open: AtomicUsize,
}

/// Snapshot served at `/stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    /// Sessions in the registry.
    pub sessions: usize,
    /// Connections in the registry.
    pub clients: usize,
    /// Sessions active within `session_timeout`.
    pub active_sessions: usize,
    /// Connections seen within `client_timeout`.
    pub active_clients: usize,
    /// Seconds since start.
    pub uptime: u64,
    /// Time of the snapshot, RFC 3339.
    pub timestamp: String,
}

/// Everything the event loop reacts to.
pub enum RelayEvent {
    /// A socket was accepted.
    Connected {
        /// Fresh id for the connection.
        connection_id: ConnectionId,
        /// Outbound side of the socket.
        handle: Arc<dyn ConnectionHandle>,
    },
    /// A text frame arrived.
    Frame {
        /// Sender.
        connection_id: ConnectionId,
        /// Raw frame text.
        text: String,
    },
    /// A frame the relay cannot interpret at all (binary).
    Unsupported {
        /// Sender.
        connection_id: ConnectionId,
    },
    /// A keep-alive pong arrived.
    Pong {
        /// Sender.
        connection_id: ConnectionId,
    },
    /// The socket closed or failed.
    Closed {
        /// The connection that went away.
        connection_id: ConnectionId,
    },
    /// Ping every open connection.
    Heartbeat,
    /// Run the reaper sweep.
    Reap,
    /// Report statistics.
    Stats {
        /// Where to send the snapshot.
        reply: oneshot::Sender<RelayStats>,
    },
    /// Close everything and stop the loop.
    Shutdown {
        /// Receives the number of connections closed.
        reply: oneshot::Sender<usize>,
    },
}

impl std::fmt::Debug for RelayEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected { connection_id, .. } => {
                f.debug_struct("Connected").field("connection_id", connection_id).finish()
            }
            Self::Frame {
                connection_id,
                text,
            } => f
                .debug_struct("Frame")
                .field("connection_id", connection_id)
                .field("len", &text.len())
                .finish(),
            Self::Unsupported { connection_id } => f
                .debug_struct("Unsupported")
                .field("connection_id", connection_id)
                .finish(),
            Self::Pong { connection_id } => {
                f.debug_struct("Pong").field("connection_id", connection_id).finish()
            }
            Self::Closed { connection_id } => {
                f.debug_struct("Closed").field("connection_id", connection_id).finish()
            }
            Self::Heartbeat => f.write_str("Heartbeat"),
            Self::Reap => f.write_str("Reap"),
            Self::Stats { .. } => f.write_str("Stats"),
            Self::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

/// Cloneable entry point into a running relay.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    events: mpsc::Sender<RelayEvent>,
    config: Arc<Config>,
    metrics: Arc<RelayMetrics>,
    started_at: Instant,
}

impl RelayHandle {
    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Seconds since the relay started.
    pub fn uptime(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Whether another connection fits under `limits.max_connections`.
    pub fn has_capacity(&self) -> bool {
        self.metrics.connections_open.load(Ordering::Relaxed) < self.config.limits.max_connections
    }

    async fn send(&self, event: RelayEvent) -> Result<()> {
        self.events.send(event).await.map_err(|_| RelayError::Stopped)
    }

    /// Register a freshly accepted connection.
    pub async fn connected(
        &self,
        connection_id: ConnectionId,
        handle: Arc<dyn ConnectionHandle>,
    ) -> Result<()> {
        self.send(RelayEvent::Connected {
            connection_id,
            handle,
        })
        .await
    }

    /// Forward an inbound text frame.
    pub async fn frame(&self, connection_id: ConnectionId, text: String) -> Result<()> {
        self.send(RelayEvent::Frame {
            connection_id,
            text,
        })
        .await
    }

    /// Report a frame kind the relay does not accept.
    pub async fn unsupported(&self, connection_id: ConnectionId) -> Result<()> {
        self.send(RelayEvent::Unsupported { connection_id }).await
    }

    /// Report a pong.
    pub async fn pong(&self, connection_id: ConnectionId) -> Result<()> {
        self.send(RelayEvent::Pong { connection_id }).await
    }

    /// Report that a socket went away.
    pub async fn closed(&self, connection_id: ConnectionId) -> Result<()> {
        self.send(RelayEvent::Closed { connection_id }).await
    }

    /// Ping every connection now.
    pub async fn heartbeat(&self) -> Result<()> {
        self.send(RelayEvent::Heartbeat).await
    }

    /// Run a reaper sweep now.
    pub async fn reap(&self) -> Result<()> {
        self.send(RelayEvent::Reap).await
    }

    /// Fetch a statistics snapshot.
    pub async fn stats(&self) -> Result<RelayStats> {
        let (reply, rx) = oneshot::channel();
        self.send(RelayEvent::Stats { reply }).await?;
        rx.await.map_err(|_| RelayError::Stopped)
    }

    /// Close every connection and stop the event loop.
    ///
    /// Returns how many connections were closed.
    pub async fn shutdown(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(RelayEvent::Shutdown { reply }).await?;
        rx.await.map_err(|_| RelayError::Stopped)
    }
}

/// Spawn the heartbeat timer.
///
/// Each tick enqueues [`RelayEvent::Heartbeat`]; the task exits once the
/// event loop has stopped listening.
pub fn spawn_heartbeat_task(events: mpsc::Sender<RelayEvent>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Heartbeat task started (interval: {}ms)", period.as_millis());

        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;
            if events.send(RelayEvent::Heartbeat).await.is_err() {
                break;
            }
        }
    })
}

/// State owned by the event loop.
pub struct SignalRelay {
    registry: Registry,
    router: Router,
    rate_limits: RateLimits,
    metrics: Arc<RelayMetrics>,
    started_at: Instant,
}

impl std::fmt::Debug for SignalRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRelay")
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("connections", &self.registry.connection_count())
            .field("sessions", &self.registry.session_count())
            .finish_non_exhaustive()
    }
}

impl SignalRelay {
    /// Build relay state from the given config.
    pub fn new(config: &Config, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            registry: Registry::new(Timeouts::from(&config.signaling)),
            router: Router::new(metrics.clone()),
            rate_limits: RateLimits::new(&config.limits),
            metrics,
            started_at: Instant::now(),
        }
    }

    /// Start the event loop and its timers.
    ///
    /// Must be called from within a tokio runtime. The returned task ends
    /// after [`RelayHandle::shutdown`].
    pub fn spawn(config: Config) -> (RelayHandle, JoinHandle<()>) {
        let metrics = Arc::new(RelayMetrics::default());
        let relay = Self::new(&config, metrics.clone());
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);

        let timers = vec![
            spawn_heartbeat_task(tx.clone(), config.signaling.heartbeat_interval()),
            reaper::spawn_reaper_task(tx.clone(), config.signaling.reap_interval()),
        ];

        let handle = RelayHandle {
            events: tx,
            config: Arc::new(config),
            metrics,
            started_at: relay.started_at,
        };

        let task = tokio::spawn(relay.run(rx, timers));
        (handle, task)
    }

    async fn run(mut self, mut events: mpsc::Receiver<RelayEvent>, timers: Vec<JoinHandle<()>>) {
        tracing::info!("Signal relay event loop started");

        while let Some(event) = events.recv().await {
            if let RelayEvent::Shutdown { reply } = event {
                let closed = self.shutdown();
                for timer in &timers {
                    timer.abort();
                }
                let _ = reply.send(closed);
                break;
            }
            self.handle_event(event);
        }

        tracing::info!("Signal relay event loop stopped");
    }

    /// Apply one event to the owned state.
    pub fn handle_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected {
                connection_id,
                handle,
            } => {
                self.registry.register_connection(connection_id, handle, false);
                self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
                tracing::info!(connection_id = %connection_id, "Connection accepted");
                self.registry
                    .send_to(&connection_id, &ServerMessage::Connected { client_id: connection_id });
            }
            RelayEvent::Frame {
                connection_id,
                text,
            } => self.handle_frame(connection_id, &text),
            RelayEvent::Unsupported { connection_id } => {
                self.router
                    .reject(&self.registry, connection_id, &ProtocolError::InvalidFormat);
            }
            RelayEvent::Pong { connection_id } => {
                self.registry.touch_connection(&connection_id);
            }
            RelayEvent::Closed { connection_id } => {
                self.router.disconnect(&mut self.registry, connection_id);
            }
            RelayEvent::Heartbeat => {
                let pinged = self.registry.ping_all();
                tracing::debug!("Heartbeat: pinged {} connections", pinged);
            }
            RelayEvent::Reap => {
                let report = reaper::sweep(&mut self.registry, &self.router, Instant::now());
                self.metrics
                    .sessions_expired
                    .fetch_add(report.expired_sessions as u64, Ordering::Relaxed);
                self.metrics
                    .connections_reaped
                    .fetch_add(report.reaped_connections as u64, Ordering::Relaxed);
                self.rate_limits.shrink();
            }
            RelayEvent::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            RelayEvent::Shutdown { reply } => {
                let _ = reply.send(self.shutdown());
            }
        }

        self.metrics
            .connections_open
            .store(self.registry.connection_count(), Ordering::Relaxed);
    }

    fn handle_frame(&mut self, connection_id: ConnectionId, text: &str) {
        if self.registry.connection(&connection_id).is_none() {
            tracing::debug!(connection_id = %connection_id, "Frame from unknown connection dropped");
            return;
        }

        if let Err(e) = self.rate_limits.check_message(&connection_id) {
            self.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(connection_id = %connection_id, "{}", e);
            self.router
                .reject(&self.registry, connection_id, &ProtocolError::RateLimited);
            return;
        }

        if let Err(e @ RateLimitError::MessageTooLarge { .. }) =
            self.rate_limits.check_size(text.len())
        {
            tracing::debug!(connection_id = %connection_id, "{}", e);
            self.router
                .reject(&self.registry, connection_id, &ProtocolError::InvalidFormat);
            return;
        }

        self.router.handle(&mut self.registry, connection_id, text);
    }

    /// Current statistics.
    pub fn stats(&self) -> RelayStats {
        let stats = self.registry.stats(Instant::now());
        RelayStats {
            sessions: stats.sessions,
            clients: stats.connections,
            active_sessions: stats.active_sessions,
            active_clients: stats.active_connections,
            uptime: self.started_at.elapsed().as_secs(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    fn shutdown(&mut self) -> usize {
        let closed = self.registry.shutdown(CLOSE_GOING_AWAY, SHUTDOWN_REASON);
        self.metrics.connections_open.store(0, Ordering::Relaxed);
        tracing::info!("Shutdown: closed {} connections", closed);
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::transport::MockHandle;
    use serde_json::json;

    fn relay_with(limits: LimitsConfig) -> SignalRelay {
        let config = Config {
            limits,
            ..Config::default()
        };
        SignalRelay::new(&config, Arc::new(RelayMetrics::default()))
    }

    fn relay() -> SignalRelay {
        relay_with(LimitsConfig::default())
    }

    fn connect(relay: &mut SignalRelay) -> (ConnectionId, MockHandle) {
        let id = ConnectionId::new();
        let handle = MockHandle::new();
        relay.handle_event(RelayEvent::Connected {
            connection_id: id,
            handle: Arc::new(handle.clone()),
        });
        (id, handle)
    }

    fn frame(relay: &mut SignalRelay, id: ConnectionId, value: serde_json::Value) {
        relay.handle_event(RelayEvent::Frame {
            connection_id: id,
            text: value.to_string(),
        });
    }

    #[test]
    fn connected_sends_client_id() {
        let mut relay = relay();
        let (id, handle) = connect(&mut relay);

        let frames = handle.frames_of("connected");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["clientId"], id.to_string());
        assert!(frames[0]["timestamp"].is_u64());
        assert_eq!(relay.metrics.connections_open.load(Ordering::Relaxed), 1);
        assert_eq!(relay.metrics.connections_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn closed_runs_disconnect_path() {
        let mut relay = relay();
        let (a, _ha) = connect(&mut relay);
        let (b, hb) = connect(&mut relay);
        frame(&mut relay, a, json!({"type": "register-host", "sessionId": "S1", "hostId": "H1"}));
        frame(&mut relay, b, json!({"type": "join-session", "sessionId": "S1"}));
        hb.clear();

        relay.handle_event(RelayEvent::Closed { connection_id: a });

        let frames = hb.frames_of("peer-disconnected");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["clientId"], a.to_string());
        assert_eq!(relay.stats().clients, 1);
        assert_eq!(relay.metrics.connections_open.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn rate_limited_frames_get_error() {
        let mut relay = relay_with(LimitsConfig {
            messages_per_minute: 2,
            ..LimitsConfig::default()
        });
        let (a, ha) = connect(&mut relay);
        ha.clear();

        for _ in 0..3 {
            frame(&mut relay, a, json!({"type": "heartbeat"}));
        }

        assert_eq!(ha.frames_of("heartbeat-ack").len(), 2);
        let errors = ha.frames_of("error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["error"], "Rate limit exceeded");
        assert_eq!(relay.metrics.rate_limit_hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn oversized_frames_are_invalid() {
        let mut relay = relay_with(LimitsConfig {
            max_message_bytes: 16,
            ..LimitsConfig::default()
        });
        let (a, ha) = connect(&mut relay);
        ha.clear();

        frame(&mut relay, a, json!({"type": "heartbeat", "padding": "xxxxxxxxxxxx"}));

        let errors = ha.frames_of("error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["error"], "Invalid message format");
    }

    #[test]
    fn unsupported_frames_are_invalid() {
        let mut relay = relay();
        let (a, ha) = connect(&mut relay);
        ha.clear();

        relay.handle_event(RelayEvent::Unsupported { connection_id: a });
        assert_eq!(ha.frames_of("error")[0]["error"], "Invalid message format");
    }

    #[test]
    fn heartbeat_pings_open_connections() {
        let mut relay = relay();
        let (_a, ha) = connect(&mut relay);
        let (_b, hb) = connect(&mut relay);
        hb.drop_connection();

        relay.handle_event(RelayEvent::Heartbeat);

        assert_eq!(ha.pings(), 1);
        assert_eq!(hb.pings(), 0);
    }

    #[test]
    fn pong_refreshes_last_ping() {
        let mut relay = relay();
        let (a, _ha) = connect(&mut relay);
        let before = relay.registry.connection(&a).unwrap().last_ping;

        std::thread::sleep(Duration::from_millis(5));
        relay.handle_event(RelayEvent::Pong { connection_id: a });

        assert!(relay.registry.connection(&a).unwrap().last_ping > before);
    }

    #[test]
    fn stats_shape() {
        let mut relay = relay();
        let (a, _) = connect(&mut relay);
        frame(&mut relay, a, json!({"type": "register-host", "sessionId": "S1", "hostId": "H1"}));

        let stats = relay.stats();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.clients, 1);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.active_clients, 1);
        assert!(chrono::DateTime::parse_from_rfc3339(&stats.timestamp).is_ok());

        let value = serde_json::to_value(&stats).unwrap();
        for key in [
            "sessions",
            "clients",
            "activeSessions",
            "activeClients",
            "uptime",
            "timestamp",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[tokio::test]
    async fn spawned_relay_serves_stats_and_shuts_down() {
        let (handle, task) = SignalRelay::spawn(Config::default());

        let conn = MockHandle::new();
        let id = ConnectionId::new();
        handle.connected(id, Arc::new(conn.clone())).await.unwrap();
        handle
            .frame(
                id,
                json!({"type": "register-host", "sessionId": "S1", "hostId": "H1"}).to_string(),
            )
            .await
            .unwrap();

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.clients, 1);
        assert!(handle.has_capacity());

        let closed = handle.shutdown().await.unwrap();
        assert_eq!(closed, 1);
        assert_eq!(
            conn.close_frame(),
            Some((CLOSE_GOING_AWAY, SHUTDOWN_REASON.to_string()))
        );

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("event loop should stop")
            .expect("event loop should not panic");
        assert!(matches!(handle.stats().await, Err(RelayError::Stopped)));
    }

    #[tokio::test]
    async fn capacity_tracks_open_connections() {
        let config = Config {
            limits: LimitsConfig {
                max_connections: 1,
                ..LimitsConfig::default()
            },
            ..Config::default()
        };
        let (handle, _task) = SignalRelay::spawn(config);
        assert!(handle.has_capacity());

        let id = ConnectionId::new();
        handle.connected(id, Arc::new(MockHandle::new())).await.unwrap();
        handle.stats().await.unwrap();
        assert!(!handle.has_capacity());

        handle.closed(id).await.unwrap();
        handle.stats().await.unwrap();
        assert!(handle.has_capacity());
    }
}

//! Periodic sweep for expired sessions and silent connections.
//!
//! The timer task never touches state. It enqueues [`RelayEvent::Reap`] and
//! the event loop calls [`sweep`], so reaping runs to completion between
//! inbound frames like everything else.

use crate::registry::Registry;
use crate::router::Router;
use crate::server::RelayEvent;
use crate::transport::CLOSE_NORMAL;
use signal_types::ServerMessage;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Close reason sent to connections evicted for silence.
pub const TIMEOUT_REASON: &str = "Connection timeout";

/// What one sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    /// Sessions removed for inactivity.
    pub expired_sessions: usize,
    /// Connections unregistered for silence.
    pub reaped_connections: usize,
    /// Auth sessions past their TTL.
    pub expired_auth_sessions: usize,
}

impl ReapReport {
    /// Whether the sweep found nothing to do.
    pub fn is_empty(&self) -> bool {
        self.expired_sessions == 0 && self.reaped_connections == 0 && self.expired_auth_sessions == 0
    }
}

/// Spawn the reaper timer.
///
/// The task exits once the event loop has stopped listening.
pub fn spawn_reaper_task(
    events: mpsc::Sender<RelayEvent>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Reaper task started (interval: {}ms)", period.as_millis());

        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;
            if events.send(RelayEvent::Reap).await.is_err() {
                tracing::debug!("Reaper task stopping: relay gone");
                break;
            }
        }
    })
}

/// Remove everything that has outlived its timeout as of `now`.
///
/// Records that disappear between listing and removal are skipped, so the
/// sweep is safe to run twice in a row.
pub fn sweep(registry: &mut Registry, router: &Router, now: Instant) -> ReapReport {
    let mut report = ReapReport::default();

    for session_id in registry.expired_sessions(now) {
        let Some(session) = registry.remove_session(&session_id) else {
            continue;
        };
        let notice = ServerMessage::SessionExpired {
            session_id: session_id.clone(),
        };
        for participant in &session.participants {
            registry.send_to(participant, &notice);
        }
        tracing::info!(
            session_id = %session_id,
            participants = session.participants.len(),
            "Session expired"
        );
        report.expired_sessions += 1;
    }

    for connection_id in registry.stale_connections(now) {
        let Some(conn) = router.disconnect(registry, connection_id) else {
            continue;
        };
        conn.handle().close(CLOSE_NORMAL, TIMEOUT_REASON);
        tracing::info!(connection_id = %connection_id, "Reaped silent connection");
        report.reaped_connections += 1;
    }

    report.expired_auth_sessions = registry.expire_auth_sessions(now);

    if report.is_empty() {
        tracing::debug!("Reaper: nothing expired");
    } else {
        tracing::info!(
            "Reaper: {} sessions, {} connections, {} auth sessions removed",
            report.expired_sessions,
            report.reaped_connections,
            report.expired_auth_sessions
        );
    }
    report
}

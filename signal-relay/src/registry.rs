//! Connection registry: the single owner of all live relay state.
//!
//! Holds sessions, per-connection records and host-authentication sessions.
//! Every operation is synchronous and runs to completion; the event loop in
//! [`crate::server`] is the only caller, so no locking is needed here.

use crate::config::SignalingConfig;
use crate::transport::ConnectionHandle;
use serde_json::Value;
use signal_types::{ConnectionId, HostId, OutboundFrame, ServerMessage, SessionId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Garbage-collection thresholds used by stats and sweeps.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Session inactivity threshold.
    pub session: Duration,
    /// Connection silence threshold.
    pub client: Duration,
    /// Auth session lifetime.
    pub auth_session: Duration,
}

impl From<&SignalingConfig> for Timeouts {
    fn from(config: &SignalingConfig) -> Self {
        Self {
            session: config.session_timeout(),
            client: config.client_timeout(),
            auth_session: config.auth_session_ttl(),
        }
    }
}

/// A candidate together with the connection that contributed it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCandidate {
    /// Contributor.
    pub from: ConnectionId,
    /// Opaque payload.
    pub candidate: Value,
}

/// A named rendezvous point.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session key.
    pub session_id: SessionId,
    /// Host identity the session was created for. Never overwritten.
    pub host_id: HostId,
    /// Connections currently joined. Never empty while the session exists.
    pub participants: HashSet<ConnectionId>,
    /// Latest offer per contributor.
    pub offers: HashMap<ConnectionId, Value>,
    /// Latest answer per contributor.
    pub answers: HashMap<ConnectionId, Value>,
    /// Candidates from all contributors, in submission order.
    pub candidates: Vec<StoredCandidate>,
    /// Creation time.
    pub created_at: Instant,
    /// Last join/leave/offer/answer/candidate.
    pub last_activity: Instant,
}

impl Session {
    fn new(session_id: SessionId, host_id: HostId) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            host_id,
            participants: HashSet::new(),
            offers: HashMap::new(),
            answers: HashMap::new(),
            candidates: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn forget(&mut self, connection_id: &ConnectionId) {
        self.participants.remove(connection_id);
        self.offers.remove(connection_id);
        self.answers.remove(connection_id);
        self.candidates.retain(|c| c.from != *connection_id);
    }
}

/// One accepted transport connection.
#[derive(Clone)]
pub struct Connection {
    /// Relay-assigned id.
    pub connection_id: ConnectionId,
    /// Session this connection is bound to, if any.
    pub session_id: Option<SessionId>,
    /// Host identity, set only for host-role connections.
    pub host_id: Option<HostId>,
    /// Whether this connection registered as a host.
    pub is_host: bool,
    /// Last heartbeat or pong.
    pub last_ping: Instant,
    /// Accept time.
    pub connected_at: Instant,
    handle: Arc<dyn ConnectionHandle>,
}

impl Connection {
    /// The transport capability for this connection.
    pub fn handle(&self) -> &Arc<dyn ConnectionHandle> {
        &self.handle
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connection_id", &self.connection_id)
            .field("session_id", &self.session_id)
            .field("host_id", &self.host_id)
            .field("is_host", &self.is_host)
            .field("open", &self.handle.is_open())
            .finish_non_exhaustive()
    }
}

/// A pending host-authentication handshake.
#[derive(Debug, Clone)]
pub struct AuthSession {
    /// Relay-minted id.
    pub session_id: SessionId,
    /// The requester.
    pub connection_id: ConnectionId,
    /// Host being reached.
    pub host_id: HostId,
    /// Creation time; the record expires a fixed TTL later.
    pub created_at: Instant,
    /// Set once the host reports `auth-success`.
    pub verified: bool,
}

/// Entity counts for the statistics surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// All sessions.
    pub sessions: usize,
    /// All connections.
    pub connections: usize,
    /// Sessions active within the session timeout.
    pub active_sessions: usize,
    /// Open connections heard from within the client timeout.
    pub active_connections: usize,
    /// Pending auth sessions.
    pub auth_sessions: usize,
}

/// Owner of all sessions, connections and auth sessions.
pub struct Registry {
    timeouts: Timeouts,
    sessions: HashMap<SessionId, Session>,
    connections: HashMap<ConnectionId, Connection>,
    auth_sessions: HashMap<SessionId, AuthSession>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("timeouts", &self.timeouts)
            .field("sessions_count", &self.sessions.len())
            .field("connections_count", &self.connections.len())
            .field("auth_sessions_count", &self.auth_sessions.len())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new(timeouts: Timeouts) -> Self {
        Self {
            timeouts,
            sessions: HashMap::new(),
            connections: HashMap::new(),
            auth_sessions: HashMap::new(),
        }
    }

    /// Configured thresholds.
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    // --- sessions ---------------------------------------------------------

    /// Create a session, or return the existing one untouched.
    pub fn create_session(&mut self, session_id: SessionId, host_id: HostId) -> &Session {
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                tracing::debug!(session_id = %session_id, host_id = %host_id, "Session created");
                Session::new(session_id, host_id)
            })
    }

    /// Whether a session exists.
    pub fn has_session(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Look up a session.
    pub fn session(&self, session_id: &SessionId) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Add a connection to a session. `false` if the session does not exist.
    pub fn join_session(&mut self, session_id: &SessionId, connection_id: ConnectionId) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        session.participants.insert(connection_id);
        session.touch();
        tracing::debug!(
            session_id = %session_id,
            connection_id = %connection_id,
            participants = session.participants.len(),
            "Joined session"
        );
        true
    }

    /// Whether a connection is currently joined to a session.
    pub fn is_participant(&self, session_id: &SessionId, connection_id: &ConnectionId) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|s| s.participants.contains(connection_id))
    }

    /// Remove a connection and everything it contributed from a session.
    ///
    /// The session is dropped when its last participant leaves. If the
    /// connection was bound to this session, the binding is cleared.
    pub fn leave_session(&mut self, session_id: &SessionId, connection_id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(&connection_id) {
            if conn.session_id.as_ref() == Some(session_id) {
                conn.session_id = None;
            }
        }

        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        session.forget(&connection_id);

        if session.participants.is_empty() {
            self.sessions.remove(session_id);
            tracing::debug!(session_id = %session_id, "Session removed (no participants)");
        } else {
            session.touch();
            tracing::debug!(
                session_id = %session_id,
                connection_id = %connection_id,
                remaining = session.participants.len(),
                "Left session"
            );
        }
    }

    /// Remove a session outright, unbinding every participant.
    pub fn remove_session(&mut self, session_id: &SessionId) -> Option<Session> {
        let session = self.sessions.remove(session_id)?;
        for participant in &session.participants {
            if let Some(conn) = self.connections.get_mut(participant) {
                if conn.session_id.as_ref() == Some(session_id) {
                    conn.session_id = None;
                }
            }
        }
        Some(session)
    }

    /// Store the latest offer from a connection. `false` if the session does not exist.
    pub fn store_offer(
        &mut self,
        session_id: &SessionId,
        connection_id: ConnectionId,
        offer: Value,
    ) -> bool {
        self.with_session(session_id, |s| {
            s.offers.insert(connection_id, offer);
        })
    }

    /// Latest offer from a connection.
    pub fn get_offer(&self, session_id: &SessionId, connection_id: &ConnectionId) -> Option<&Value> {
        self.sessions.get(session_id)?.offers.get(connection_id)
    }

    /// Store the latest answer from a connection. `false` if the session does not exist.
    pub fn store_answer(
        &mut self,
        session_id: &SessionId,
        connection_id: ConnectionId,
        answer: Value,
    ) -> bool {
        self.with_session(session_id, |s| {
            s.answers.insert(connection_id, answer);
        })
    }

    /// Latest answer from a connection.
    pub fn get_answer(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Option<&Value> {
        self.sessions.get(session_id)?.answers.get(connection_id)
    }

    /// Append a candidate from a connection. `false` if the session does not exist.
    pub fn store_candidate(
        &mut self,
        session_id: &SessionId,
        connection_id: ConnectionId,
        candidate: Value,
    ) -> bool {
        self.with_session(session_id, |s| {
            s.candidates.push(StoredCandidate {
                from: connection_id,
                candidate,
            });
        })
    }

    /// Every candidate contributed by connections other than `exclude`, in
    /// submission order.
    pub fn get_candidates_for_client(
        &self,
        session_id: &SessionId,
        exclude: &ConnectionId,
    ) -> Vec<StoredCandidate> {
        self.sessions
            .get(session_id)
            .map(|s| {
                s.candidates
                    .iter()
                    .filter(|c| c.from != *exclude)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Offers contributed by connections other than `exclude`.
    pub fn get_offers_for_client(
        &self,
        session_id: &SessionId,
        exclude: &ConnectionId,
    ) -> Vec<(ConnectionId, Value)> {
        Self::others(self.sessions.get(session_id).map(|s| &s.offers), exclude)
    }

    /// Answers contributed by connections other than `exclude`.
    pub fn get_answers_for_client(
        &self,
        session_id: &SessionId,
        exclude: &ConnectionId,
    ) -> Vec<(ConnectionId, Value)> {
        Self::others(self.sessions.get(session_id).map(|s| &s.answers), exclude)
    }

    fn others(
        slots: Option<&HashMap<ConnectionId, Value>>,
        exclude: &ConnectionId,
    ) -> Vec<(ConnectionId, Value)> {
        slots
            .map(|m| {
                m.iter()
                    .filter(|(from, _)| *from != exclude)
                    .map(|(from, v)| (*from, v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn with_session(&mut self, session_id: &SessionId, f: impl FnOnce(&mut Session)) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(session) => {
                f(session);
                session.touch();
                true
            }
            None => false,
        }
    }

    // --- connections ------------------------------------------------------

    /// Record a connection, or update the role of an existing one.
    ///
    /// Re-registering keeps the original timestamps and binding; `is_host`
    /// can be raised but never cleared.
    pub fn register_connection(
        &mut self,
        connection_id: ConnectionId,
        handle: Arc<dyn ConnectionHandle>,
        is_host: bool,
    ) {
        if let Some(existing) = self.connections.get_mut(&connection_id) {
            existing.is_host |= is_host;
            return;
        }
        let now = Instant::now();
        self.connections.insert(
            connection_id,
            Connection {
                connection_id,
                session_id: None,
                host_id: None,
                is_host,
                last_ping: now,
                connected_at: now,
                handle,
            },
        );
        tracing::debug!(
            connection_id = %connection_id,
            total = self.connections.len(),
            "Connection registered"
        );
    }

    /// Mark a connection as the host for `host_id`.
    pub fn assign_host(&mut self, connection_id: &ConnectionId, host_id: HostId) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(conn) => {
                conn.is_host = true;
                conn.host_id = Some(host_id);
                true
            }
            None => false,
        }
    }

    /// Look up a connection.
    pub fn connection(&self, connection_id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(connection_id)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Bind a connection to a session. `false` if the connection is unknown
    /// or already bound to a different session.
    pub fn bind_connection_to_session(
        &mut self,
        connection_id: &ConnectionId,
        session_id: &SessionId,
    ) -> bool {
        let Some(conn) = self.connections.get_mut(connection_id) else {
            return false;
        };
        match &conn.session_id {
            Some(current) if current != session_id => false,
            _ => {
                conn.session_id = Some(session_id.clone());
                true
            }
        }
    }

    /// Refresh a connection's liveness timestamp.
    pub fn touch_connection(&mut self, connection_id: &ConnectionId) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(conn) => {
                conn.last_ping = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a connection record, leaving its session and dropping any auth
    /// sessions it took part in.
    pub fn unregister_connection(&mut self, connection_id: &ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(connection_id)?;

        if let Some(session_id) = &conn.session_id {
            self.leave_session(session_id, *connection_id);
        }

        let host_gone = conn
            .host_id
            .as_ref()
            .filter(|host_id| self.find_host_connection(host_id).is_none());
        self.auth_sessions.retain(|_, auth| {
            auth.connection_id != *connection_id && Some(&auth.host_id) != host_gone
        });

        tracing::debug!(
            connection_id = %connection_id,
            remaining = self.connections.len(),
            "Connection unregistered"
        );
        Some(conn)
    }

    /// The most recently connected host connection for `host_id`.
    pub fn find_host_connection(&self, host_id: &HostId) -> Option<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.is_host && c.host_id.as_ref() == Some(host_id) && c.handle.is_open())
            .max_by_key(|c| c.connected_at)
            .map(|c| c.connection_id)
    }

    // --- delivery ---------------------------------------------------------

    /// Send a message to one connection.
    ///
    /// Returns `false` if the connection is unknown, closed, or the
    /// transport rejects the frame. Never panics on transport failure.
    pub fn send_to(&self, connection_id: &ConnectionId, message: &ServerMessage) -> bool {
        let Some(text) = encode(message) else {
            return false;
        };
        self.send_text(connection_id, text)
    }

    /// Send a message to every participant of a session except `exclude`.
    ///
    /// Returns the number of successful deliveries. A failed delivery does
    /// not stop the rest.
    pub fn broadcast_to_session(
        &self,
        session_id: &SessionId,
        message: &ServerMessage,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let Some(session) = self.sessions.get(session_id) else {
            return 0;
        };
        let Some(text) = encode(message) else {
            return 0;
        };

        session
            .participants
            .iter()
            .filter(|id| Some(*id) != exclude)
            .filter(|id| self.send_text(id, text.clone()))
            .count()
    }

    fn send_text(&self, connection_id: &ConnectionId, text: String) -> bool {
        let Some(conn) = self.connections.get(connection_id) else {
            return false;
        };
        if !conn.handle.is_open() {
            return false;
        }
        match conn.handle.send(text) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, "Send failed: {}", e);
                false
            }
        }
    }

    /// Ping every open connection. Returns how many pings were queued.
    pub fn ping_all(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.handle.is_open())
            .filter(|c| match c.handle.ping() {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(connection_id = %c.connection_id, "Ping failed: {}", e);
                    false
                }
            })
            .count()
    }

    /// Close every open connection and drop all state.
    pub fn shutdown(&mut self, code: u16, reason: &str) -> usize {
        let mut closed = 0;
        for conn in self.connections.values() {
            if conn.handle.is_open() {
                conn.handle.close(code, reason);
                closed += 1;
            }
        }
        self.connections.clear();
        self.sessions.clear();
        self.auth_sessions.clear();
        closed
    }

    // --- auth sessions ----------------------------------------------------

    /// Start a host-authentication handshake for `requester`.
    pub fn create_auth_session(&mut self, requester: ConnectionId, host_id: HostId) -> SessionId {
        let session_id = SessionId::random();
        self.auth_sessions.insert(
            session_id.clone(),
            AuthSession {
                session_id: session_id.clone(),
                connection_id: requester,
                host_id,
                created_at: Instant::now(),
                verified: false,
            },
        );
        session_id
    }

    /// Look up an auth session, treating expired ones as absent.
    pub fn auth_session(&self, session_id: &SessionId) -> Option<&AuthSession> {
        let ttl = self.timeouts.auth_session;
        self.auth_sessions
            .get(session_id)
            .filter(|a| Instant::now().saturating_duration_since(a.created_at) <= ttl)
    }

    /// Record that the host accepted the requester.
    pub fn mark_auth_verified(&mut self, session_id: &SessionId) -> bool {
        match self.auth_sessions.get_mut(session_id) {
            Some(auth) => {
                auth.verified = true;
                true
            }
            None => false,
        }
    }

    /// Drop an auth session.
    pub fn remove_auth_session(&mut self, session_id: &SessionId) -> Option<AuthSession> {
        self.auth_sessions.remove(session_id)
    }

    // --- sweeps -----------------------------------------------------------

    /// Sessions idle past the session timeout as of `now`.
    pub fn expired_sessions(&self, now: Instant) -> Vec<SessionId> {
        let timeout = self.timeouts.session;
        self.sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_activity) > timeout)
            .map(|s| s.session_id.clone())
            .collect()
    }

    /// Connections silent past the client timeout as of `now`.
    pub fn stale_connections(&self, now: Instant) -> Vec<ConnectionId> {
        let timeout = self.timeouts.client;
        self.connections
            .values()
            .filter(|c| now.saturating_duration_since(c.last_ping) > timeout)
            .map(|c| c.connection_id)
            .collect()
    }

    /// Drop auth sessions older than their TTL as of `now`.
    pub fn expire_auth_sessions(&mut self, now: Instant) -> usize {
        let ttl = self.timeouts.auth_session;
        let before = self.auth_sessions.len();
        self.auth_sessions
            .retain(|_, a| now.saturating_duration_since(a.created_at) <= ttl);
        before - self.auth_sessions.len()
    }

    /// Total and active entity counts as of `now`.
    pub fn stats(&self, now: Instant) -> RegistryStats {
        let active_sessions = self
            .sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_activity) <= self.timeouts.session)
            .count();
        let active_connections = self
            .connections
            .values()
            .filter(|c| {
                c.handle.is_open()
                    && now.saturating_duration_since(c.last_ping) <= self.timeouts.client
            })
            .count();

        RegistryStats {
            sessions: self.sessions.len(),
            connections: self.connections.len(),
            active_sessions,
            active_connections,
            auth_sessions: self.auth_sessions.len(),
        }
    }
}

fn encode(message: &ServerMessage) -> Option<String> {
    match OutboundFrame::new(message).to_json() {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!("Failed to serialize outbound message: {}", e);
            None
        }
    }
}

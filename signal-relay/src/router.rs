//! Message router.
//!
//! Parses each inbound text frame into a [`ClientMessage`], validates it,
//! applies its effect to the [`Registry`] and emits the unicast/broadcast
//! replies. Every failure becomes a unicast `error` to the sender; the
//! connection stays open and no other state changes.

use crate::registry::{Connection, Registry};
use crate::server::RelayMetrics;
use serde_json::Value;
use signal_types::{ClientMessage, ConnectionId, HostId, ProtocolError, ServerMessage, SessionId};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Which side of an auth session a connection is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthRole {
    Requester,
    Host,
}

/// Stateless dispatcher over a [`Registry`].
#[derive(Debug, Clone)]
pub struct Router {
    metrics: Arc<RelayMetrics>,
}

impl Router {
    /// Create a router that reports into `metrics`.
    pub fn new(metrics: Arc<RelayMetrics>) -> Self {
        Self { metrics }
    }

    /// Handle one raw text frame from `connection_id`.
    pub fn handle(&self, registry: &mut Registry, connection_id: ConnectionId, raw: &str) {
        if registry.connection(&connection_id).is_none() {
            tracing::debug!(connection_id = %connection_id, "Frame from unknown connection dropped");
            return;
        }
        self.metrics.messages_total.fetch_add(1, Ordering::Relaxed);

        let result =
            ClientMessage::parse(raw).and_then(|msg| self.dispatch(registry, connection_id, msg));

        if let Err(e) = result {
            self.reject(registry, connection_id, &e);
        }
    }

    /// Report a protocol error back to the sender.
    pub fn reject(&self, registry: &Registry, connection_id: ConnectionId, err: &ProtocolError) {
        self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection_id = %connection_id, "Rejected message: {}", err);
        registry.send_to(&connection_id, &ServerMessage::error(err));
    }

    fn dispatch(
        &self,
        registry: &mut Registry,
        id: ConnectionId,
        message: ClientMessage,
    ) -> Result<(), ProtocolError> {
        tracing::trace!(connection_id = %id, kind = message.kind(), "Dispatching");

        match message {
            ClientMessage::RegisterHost {
                session_id,
                host_id,
            } => self.handle_register_host(registry, id, session_id, host_id),
            ClientMessage::JoinSession { session_id } => {
                self.handle_join_session(registry, id, session_id)
            }
            ClientMessage::Offer { session_id, offer } => {
                self.require_participant(registry, id, &session_id)?;
                registry.store_offer(&session_id, id, offer.clone());
                let msg = ServerMessage::OfferReceived {
                    session_id: session_id.clone(),
                    client_id: id,
                    offer,
                };
                registry.broadcast_to_session(&session_id, &msg, Some(&id));
                Ok(())
            }
            ClientMessage::Answer { session_id, answer } => {
                self.require_participant(registry, id, &session_id)?;
                registry.store_answer(&session_id, id, answer.clone());
                let msg = ServerMessage::AnswerReceived {
                    session_id: session_id.clone(),
                    client_id: id,
                    answer,
                };
                registry.broadcast_to_session(&session_id, &msg, Some(&id));
                Ok(())
            }
            ClientMessage::IceCandidate {
                session_id,
                candidate,
            } => {
                self.require_participant(registry, id, &session_id)?;
                registry.store_candidate(&session_id, id, candidate.clone());
                let msg = ServerMessage::CandidateReceived {
                    session_id: session_id.clone(),
                    client_id: id,
                    candidate,
                };
                registry.broadcast_to_session(&session_id, &msg, Some(&id));
                Ok(())
            }
            ClientMessage::Heartbeat => {
                self.handle_heartbeat(registry, id);
                Ok(())
            }
            ClientMessage::ConnectToHost { host_id } => {
                self.handle_connect_to_host(registry, id, host_id)
            }
            ClientMessage::VerifyTotp { session_id, code } => {
                let (_, host) = self.auth_counterpart(registry, id, &session_id, AuthRole::Requester)?;
                registry.send_to(
                    &host,
                    &ServerMessage::VerifyTotp {
                        session_id,
                        client_id: id,
                        code,
                    },
                );
                Ok(())
            }
            ClientMessage::AuthSuccess { session_id } => {
                let (host_id, requester) =
                    self.auth_counterpart(registry, id, &session_id, AuthRole::Host)?;
                registry.mark_auth_verified(&session_id);
                tracing::info!(auth_session = %session_id, host_id = %host_id, "Host accepted requester");
                registry.send_to(
                    &requester,
                    &ServerMessage::AuthSuccess {
                        session_id,
                        host_id,
                    },
                );
                Ok(())
            }
            ClientMessage::AuthFailure { session_id, reason } => {
                let (_, requester) =
                    self.auth_counterpart(registry, id, &session_id, AuthRole::Host)?;
                registry.remove_auth_session(&session_id);
                registry.send_to(&requester, &ServerMessage::AuthFailure { session_id, reason });
                Ok(())
            }
            ClientMessage::WebrtcOffer { session_id, offer } => {
                let (_, host) = self.auth_counterpart(registry, id, &session_id, AuthRole::Requester)?;
                registry.send_to(
                    &host,
                    &ServerMessage::WebrtcOffer {
                        session_id,
                        client_id: id,
                        offer,
                    },
                );
                Ok(())
            }
            ClientMessage::WebrtcAnswer { session_id, answer } => {
                let (_, requester) =
                    self.auth_counterpart(registry, id, &session_id, AuthRole::Host)?;
                registry.send_to(&requester, &ServerMessage::WebrtcAnswer { session_id, answer });
                Ok(())
            }
            ClientMessage::WebrtcIceCandidate {
                session_id,
                candidate,
            } => self.handle_auth_candidate(registry, id, session_id, candidate),
        }
    }

    /// Only contributions from joined participants are stored, so leaving
    /// is enough to drop everything a connection left behind.
    fn require_participant(
        &self,
        registry: &Registry,
        id: ConnectionId,
        session_id: &SessionId,
    ) -> Result<(), ProtocolError> {
        if !registry.has_session(session_id) {
            return Err(ProtocolError::SessionNotFound(session_id.to_string()));
        }
        if !registry.is_participant(session_id, &id) {
            return Err(ProtocolError::NotParticipant(session_id.to_string()));
        }
        Ok(())
    }

    /// Ack a heartbeat and refresh the sender's `last_ping`.
    ///
    /// The bound session's `last_activity` is left alone: session expiry
    /// tracks signaling traffic, and an otherwise idle session kept open only
    /// by heartbeats still expires after the session timeout.
    fn handle_heartbeat(&self, registry: &mut Registry, id: ConnectionId) {
        registry.touch_connection(&id);
        registry.send_to(&id, &ServerMessage::HeartbeatAck {});
    }

    fn handle_register_host(
        &self,
        registry: &mut Registry,
        id: ConnectionId,
        session_id: SessionId,
        host_id: HostId,
    ) -> Result<(), ProtocolError> {
        registry.assign_host(&id, host_id.clone());

        if !registry.has_session(&session_id) {
            self.metrics.sessions_created.fetch_add(1, Ordering::Relaxed);
        }
        registry.create_session(session_id.clone(), host_id.clone());
        self.bind(registry, id, &session_id);

        tracing::info!(
            connection_id = %id,
            session_id = %session_id,
            host_id = %host_id,
            "Host registered"
        );
        registry.send_to(&id, &ServerMessage::HostRegistered { session_id });
        Ok(())
    }

    fn handle_join_session(
        &self,
        registry: &mut Registry,
        id: ConnectionId,
        session_id: SessionId,
    ) -> Result<(), ProtocolError> {
        if !registry.has_session(&session_id) {
            return Err(ProtocolError::SessionNotFound(session_id.to_string()));
        }
        let rejoin = registry.is_participant(&session_id, &id);
        self.bind(registry, id, &session_id);

        registry.send_to(
            &id,
            &ServerMessage::SessionJoined {
                session_id: session_id.clone(),
                client_id: id,
            },
        );
        if rejoin {
            tracing::debug!(connection_id = %id, session_id = %session_id, "Repeated join ignored");
            return Ok(());
        }

        tracing::info!(connection_id = %id, session_id = %session_id, "Peer joined");
        registry.broadcast_to_session(
            &session_id,
            &ServerMessage::PeerConnected {
                session_id: session_id.clone(),
                client_id: id,
            },
            Some(&id),
        );

        // Late joiners get everything the others already negotiated.
        for (from, offer) in registry.get_offers_for_client(&session_id, &id) {
            let msg = ServerMessage::OfferReceived {
                session_id: session_id.clone(),
                client_id: from,
                offer,
            };
            registry.send_to(&id, &msg);
        }
        for (from, answer) in registry.get_answers_for_client(&session_id, &id) {
            let msg = ServerMessage::AnswerReceived {
                session_id: session_id.clone(),
                client_id: from,
                answer,
            };
            registry.send_to(&id, &msg);
        }
        for stored in registry.get_candidates_for_client(&session_id, &id) {
            let msg = ServerMessage::CandidateReceived {
                session_id: session_id.clone(),
                client_id: stored.from,
                candidate: stored.candidate,
            };
            registry.send_to(&id, &msg);
        }
        Ok(())
    }

    /// Join `session_id` and bind to it, leaving any other session first.
    fn bind(&self, registry: &mut Registry, id: ConnectionId, session_id: &SessionId) {
        let previous = registry
            .connection(&id)
            .and_then(|c| c.session_id.clone())
            .filter(|prev| prev != session_id);

        if let Some(prev) = previous {
            registry.broadcast_to_session(
                &prev,
                &ServerMessage::PeerDisconnected {
                    session_id: prev.clone(),
                    client_id: id,
                },
                Some(&id),
            );
            registry.leave_session(&prev, id);
        }

        registry.join_session(session_id, id);
        registry.bind_connection_to_session(&id, session_id);
    }

    fn handle_connect_to_host(
        &self,
        registry: &mut Registry,
        id: ConnectionId,
        host_id: HostId,
    ) -> Result<(), ProtocolError> {
        let host = registry
            .find_host_connection(&host_id)
            .ok_or_else(|| ProtocolError::HostNotFound(host_id.to_string()))?;

        let auth_id = registry.create_auth_session(id, host_id.clone());
        tracing::info!(
            connection_id = %id,
            host_id = %host_id,
            auth_session = %auth_id,
            "Auth session started"
        );

        registry.send_to(
            &id,
            &ServerMessage::AuthRequired {
                session_id: auth_id.clone(),
                host_id,
            },
        );
        registry.send_to(
            &host,
            &ServerMessage::ConnectToHost {
                session_id: auth_id,
                client_id: id,
            },
        );
        Ok(())
    }

    fn handle_auth_candidate(
        &self,
        registry: &mut Registry,
        id: ConnectionId,
        session_id: SessionId,
        candidate: Value,
    ) -> Result<(), ProtocolError> {
        let role = self.auth_role(registry, id, &session_id)?;
        let (_, counterpart) = self.auth_counterpart(registry, id, &session_id, role)?;
        registry.send_to(
            &counterpart,
            &ServerMessage::WebrtcIceCandidate {
                session_id,
                client_id: id,
                candidate,
            },
        );
        Ok(())
    }

    /// Which role `id` holds in the auth session.
    fn auth_role(
        &self,
        registry: &Registry,
        id: ConnectionId,
        session_id: &SessionId,
    ) -> Result<AuthRole, ProtocolError> {
        let auth = registry
            .auth_session(session_id)
            .ok_or_else(|| ProtocolError::AuthSessionNotFound(session_id.to_string()))?;

        if auth.connection_id == id {
            return Ok(AuthRole::Requester);
        }
        let is_host = registry
            .connection(&id)
            .is_some_and(|c| c.is_host && c.host_id.as_ref() == Some(&auth.host_id));
        if is_host {
            Ok(AuthRole::Host)
        } else {
            Err(ProtocolError::NotAuthorized(session_id.to_string()))
        }
    }

    /// Check that `id` holds `expected` and resolve the other side.
    ///
    /// Returns the auth session's host id and the counterpart connection.
    fn auth_counterpart(
        &self,
        registry: &Registry,
        id: ConnectionId,
        session_id: &SessionId,
        expected: AuthRole,
    ) -> Result<(HostId, ConnectionId), ProtocolError> {
        if self.auth_role(registry, id, session_id)? != expected {
            return Err(ProtocolError::NotAuthorized(session_id.to_string()));
        }
        let auth = registry
            .auth_session(session_id)
            .ok_or_else(|| ProtocolError::AuthSessionNotFound(session_id.to_string()))?;

        let counterpart = match expected {
            AuthRole::Host => auth.connection_id,
            AuthRole::Requester => registry
                .find_host_connection(&auth.host_id)
                .ok_or_else(|| ProtocolError::HostNotFound(auth.host_id.to_string()))?,
        };
        Ok((auth.host_id.clone(), counterpart))
    }

    /// Tear down a connection.
    ///
    /// Remaining participants of its session (never the connection itself)
    /// receive `peer-disconnected`; then the record is unregistered.
    pub fn disconnect(&self, registry: &mut Registry, id: ConnectionId) -> Option<Connection> {
        let session_id = registry.connection(&id)?.session_id.clone();

        if let Some(session_id) = session_id {
            registry.broadcast_to_session(
                &session_id,
                &ServerMessage::PeerDisconnected {
                    session_id: session_id.clone(),
                    client_id: id,
                },
                Some(&id),
            );
        }

        let conn = registry.unregister_connection(&id);
        tracing::info!(connection_id = %id, "Connection removed");
        conn
    }
}

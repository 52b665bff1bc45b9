//! Protocol messages for the signaling relay.
//!
//! Inbound frames are validated into a [`ClientMessage`]; everything the relay
//! emits is a [`ServerMessage`]. Both unions cover two phases: the generic
//! session relay (offer/answer/candidate keyed by session membership) and the
//! host-authentication phase (forwarding keyed by host id and auth session).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConnectionId, HostId, InboundEnvelope, ProtocolError, SessionId};

/// Every message a client may send, after field validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Host announces a session it will accept peers into.
    RegisterHost {
        /// Session to create or reuse.
        session_id: SessionId,
        /// Logical host identity.
        host_id: HostId,
    },
    /// Peer joins an existing session.
    JoinSession {
        /// Session to join.
        session_id: SessionId,
    },
    /// Connection-negotiation offer for the session.
    Offer {
        /// Target session.
        session_id: SessionId,
        /// Opaque offer payload.
        offer: Value,
    },
    /// Connection-negotiation answer for the session.
    Answer {
        /// Target session.
        session_id: SessionId,
        /// Opaque answer payload.
        answer: Value,
    },
    /// Reachability candidate for the session.
    IceCandidate {
        /// Target session.
        session_id: SessionId,
        /// Opaque candidate payload.
        candidate: Value,
    },
    /// Application-level liveness probe.
    Heartbeat,
    /// Requester asks to reach a host by its host id.
    ConnectToHost {
        /// Host to reach.
        host_id: HostId,
    },
    /// Requester submits a one-time code for the host to check.
    VerifyTotp {
        /// Auth session.
        session_id: SessionId,
        /// Code as typed by the user.
        code: String,
    },
    /// Host accepted the requester.
    AuthSuccess {
        /// Auth session.
        session_id: SessionId,
    },
    /// Host rejected the requester.
    AuthFailure {
        /// Auth session.
        session_id: SessionId,
        /// Optional human-readable reason.
        reason: Option<String>,
    },
    /// Requester's offer, forwarded to the host.
    WebrtcOffer {
        /// Auth session.
        session_id: SessionId,
        /// Opaque offer payload.
        offer: Value,
    },
    /// Host's answer, forwarded to the requester.
    WebrtcAnswer {
        /// Auth session.
        session_id: SessionId,
        /// Opaque answer payload.
        answer: Value,
    },
    /// Candidate from either side, forwarded to the other.
    WebrtcIceCandidate {
        /// Auth session.
        session_id: SessionId,
        /// Opaque candidate payload.
        candidate: Value,
    },
}

impl ClientMessage {
    /// Wire name of this message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegisterHost { .. } => "register-host",
            Self::JoinSession { .. } => "join-session",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Heartbeat => "heartbeat",
            Self::ConnectToHost { .. } => "connect-to-host",
            Self::VerifyTotp { .. } => "verify-totp",
            Self::AuthSuccess { .. } => "auth-success",
            Self::AuthFailure { .. } => "auth-failure",
            Self::WebrtcOffer { .. } => "webrtc-offer",
            Self::WebrtcAnswer { .. } => "webrtc-answer",
            Self::WebrtcIceCandidate { .. } => "webrtc-ice-candidate",
        }
    }

    /// Parse and validate a raw text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        InboundEnvelope::parse(text)?.try_into()
    }
}

/// Treat absent, `null` and empty-string values alike.
fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl TryFrom<InboundEnvelope> for ClientMessage {
    type Error = ProtocolError;

    fn try_from(env: InboundEnvelope) -> Result<Self, Self::Error> {
        let session_id = present(env.session_id).map(SessionId::from);
        let host_id = present(env.host_id).map(HostId::from);

        let msg = match env.kind.as_str() {
            "register-host" => match (session_id, host_id) {
                (Some(session_id), Some(host_id)) => Self::RegisterHost {
                    session_id,
                    host_id,
                },
                _ => {
                    return Err(ProtocolError::MissingField(
                        "Missing sessionId or hostId for host registration",
                    ))
                }
            },
            "join-session" => Self::JoinSession {
                session_id: session_id.ok_or(ProtocolError::MissingField(
                    "Missing sessionId for session join",
                ))?,
            },
            "offer" => match (session_id, env.offer) {
                (Some(session_id), Some(offer)) => Self::Offer { session_id, offer },
                _ => return Err(ProtocolError::MissingField("Missing sessionId or offer")),
            },
            "answer" => match (session_id, env.answer) {
                (Some(session_id), Some(answer)) => Self::Answer { session_id, answer },
                _ => return Err(ProtocolError::MissingField("Missing sessionId or answer")),
            },
            "ice-candidate" => match (session_id, env.candidate) {
                (Some(session_id), Some(candidate)) => Self::IceCandidate {
                    session_id,
                    candidate,
                },
                _ => {
                    return Err(ProtocolError::MissingField(
                        "Missing sessionId or candidate",
                    ))
                }
            },
            "heartbeat" => Self::Heartbeat,
            "connect-to-host" => Self::ConnectToHost {
                host_id: host_id.ok_or(ProtocolError::MissingField(
                    "Missing hostId for host connection",
                ))?,
            },
            "verify-totp" => match (session_id, present(env.code)) {
                (Some(session_id), Some(code)) => Self::VerifyTotp { session_id, code },
                _ => {
                    return Err(ProtocolError::MissingField(
                        "Missing sessionId or code for TOTP verification",
                    ))
                }
            },
            "auth-success" => Self::AuthSuccess {
                session_id: session_id.ok_or(ProtocolError::MissingField(
                    "Missing sessionId for auth success",
                ))?,
            },
            "auth-failure" => Self::AuthFailure {
                session_id: session_id.ok_or(ProtocolError::MissingField(
                    "Missing sessionId for auth failure",
                ))?,
                reason: present(env.reason),
            },
            "webrtc-offer" => match (session_id, env.offer) {
                (Some(session_id), Some(offer)) => Self::WebrtcOffer { session_id, offer },
                _ => return Err(ProtocolError::MissingField("Missing sessionId or offer")),
            },
            "webrtc-answer" => match (session_id, env.answer) {
                (Some(session_id), Some(answer)) => Self::WebrtcAnswer { session_id, answer },
                _ => return Err(ProtocolError::MissingField("Missing sessionId or answer")),
            },
            "webrtc-ice-candidate" => match (session_id, env.candidate) {
                (Some(session_id), Some(candidate)) => Self::WebrtcIceCandidate {
                    session_id,
                    candidate,
                },
                _ => {
                    return Err(ProtocolError::MissingField(
                        "Missing sessionId or candidate",
                    ))
                }
            },
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };

        Ok(msg)
    }
}

/// Every message the relay sends.
///
/// Serialized with a kebab-case `type` tag and camelCase fields; wrap in
/// [`crate::OutboundFrame`] to add the relay timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent once on accept with the relay-assigned id.
    Connected {
        /// This connection's id.
        client_id: ConnectionId,
    },
    /// Host registration accepted.
    HostRegistered {
        /// Registered session.
        session_id: SessionId,
    },
    /// Join accepted.
    SessionJoined {
        /// Joined session.
        session_id: SessionId,
        /// The joiner's id.
        client_id: ConnectionId,
    },
    /// Another connection joined the session.
    PeerConnected {
        /// Session.
        session_id: SessionId,
        /// The new participant.
        client_id: ConnectionId,
    },
    /// A participant left the session.
    PeerDisconnected {
        /// Session.
        session_id: SessionId,
        /// The departed participant.
        client_id: ConnectionId,
    },
    /// A participant submitted an offer.
    OfferReceived {
        /// Session.
        session_id: SessionId,
        /// Contributor.
        client_id: ConnectionId,
        /// Opaque offer payload.
        offer: Value,
    },
    /// A participant submitted an answer.
    AnswerReceived {
        /// Session.
        session_id: SessionId,
        /// Contributor.
        client_id: ConnectionId,
        /// Opaque answer payload.
        answer: Value,
    },
    /// A participant submitted a candidate.
    CandidateReceived {
        /// Session.
        session_id: SessionId,
        /// Contributor.
        client_id: ConnectionId,
        /// Opaque candidate payload.
        candidate: Value,
    },
    /// Reply to `heartbeat`; the frame timestamp carries the relay time.
    HeartbeatAck {},
    /// The session was removed for inactivity.
    SessionExpired {
        /// Expired session.
        session_id: SessionId,
    },
    /// The previous message was rejected.
    Error {
        /// Human-readable reason.
        error: String,
    },
    /// To the requester: the host was found, authenticate against this id.
    AuthRequired {
        /// Newly minted auth session.
        session_id: SessionId,
        /// Host being reached.
        host_id: HostId,
    },
    /// To the host: a requester wants to connect.
    ConnectToHost {
        /// Auth session.
        session_id: SessionId,
        /// Requester.
        client_id: ConnectionId,
    },
    /// To the host: the requester's code, verbatim.
    VerifyTotp {
        /// Auth session.
        session_id: SessionId,
        /// Requester.
        client_id: ConnectionId,
        /// Code as submitted.
        code: String,
    },
    /// To the requester: the host accepted.
    AuthSuccess {
        /// Auth session.
        session_id: SessionId,
        /// Host that accepted.
        host_id: HostId,
    },
    /// To the requester: the host rejected.
    AuthFailure {
        /// Auth session.
        session_id: SessionId,
        /// Reason given by the host, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// To the host: the requester's offer.
    WebrtcOffer {
        /// Auth session.
        session_id: SessionId,
        /// Requester.
        client_id: ConnectionId,
        /// Opaque offer payload.
        offer: Value,
    },
    /// To the requester: the host's answer.
    WebrtcAnswer {
        /// Auth session.
        session_id: SessionId,
        /// Opaque answer payload.
        answer: Value,
    },
    /// To the counterpart: a candidate.
    WebrtcIceCandidate {
        /// Auth session.
        session_id: SessionId,
        /// Contributor.
        client_id: ConnectionId,
        /// Opaque candidate payload.
        candidate: Value,
    },
}

impl ServerMessage {
    /// Build an `error` message from a protocol error.
    pub fn error(err: &ProtocolError) -> Self {
        Self::Error {
            error: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_host_requires_both_ids() {
        let msg = ClientMessage::parse(r#"{"type":"register-host","sessionId":"S1","hostId":"H1"}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::RegisterHost {
                session_id: "S1".into(),
                host_id: "H1".into(),
            }
        );

        let err = ClientMessage::parse(r#"{"type":"register-host","sessionId":"S1"}"#).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing sessionId or hostId for host registration"
        );
    }

    #[test]
    fn empty_session_id_counts_as_missing() {
        let err = ClientMessage::parse(r#"{"type":"join-session","sessionId":""}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("Missing sessionId for session join"));
    }

    #[test]
    fn null_payload_counts_as_missing() {
        let err =
            ClientMessage::parse(r#"{"type":"offer","sessionId":"S1","offer":null}"#).unwrap_err();
        assert_eq!(err.to_string(), "Missing sessionId or offer");
    }

    #[test]
    fn offer_payload_is_kept_verbatim() {
        let msg = ClientMessage::parse(
            r#"{"type":"offer","sessionId":"S1","offer":{"type":"offer","sdp":"v=0"}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Offer { session_id, offer } => {
                assert_eq!(session_id.as_str(), "S1");
                assert_eq!(offer, json!({"type":"offer","sdp":"v=0"}));
            }
            other => panic!("Expected Offer, got {other:?}"),
        }
    }

    #[test]
    fn heartbeat_needs_no_fields() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"heartbeat"}"#).unwrap(),
            ClientMessage::Heartbeat
        );
    }

    #[test]
    fn unknown_type_is_reported_by_name() {
        let err = ClientMessage::parse(r#"{"type":"frobnicate"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unknown message type: frobnicate");
    }

    #[test]
    fn auth_phase_messages_validate() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"connect-to-host"}"#).unwrap_err(),
            ProtocolError::MissingField("Missing hostId for host connection")
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"verify-totp","sessionId":"A"}"#).unwrap_err(),
            ProtocolError::MissingField("Missing sessionId or code for TOTP verification")
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"auth-failure","sessionId":"A","reason":"bad"}"#)
                .unwrap(),
            ClientMessage::AuthFailure {
                session_id: "A".into(),
                reason: Some("bad".into()),
            }
        );
    }

    #[test]
    fn kind_matches_wire_name() {
        let msg = ClientMessage::parse(
            r#"{"type":"webrtc-ice-candidate","sessionId":"A","candidate":{"c":1}}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), "webrtc-ice-candidate");
    }

    #[test]
    fn server_message_tags_and_field_names() {
        let client_id = ConnectionId::new();
        let value = serde_json::to_value(ServerMessage::SessionJoined {
            session_id: "S1".into(),
            client_id,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "session-joined", "sessionId": "S1", "clientId": client_id.to_string()})
        );

        let value = serde_json::to_value(ServerMessage::WebrtcIceCandidate {
            session_id: "A".into(),
            client_id,
            candidate: json!("c"),
        })
        .unwrap();
        assert_eq!(value["type"], "webrtc-ice-candidate");
    }

    #[test]
    fn server_message_parses_with_extra_timestamp() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"error","error":"Invalid message format","timestamp":1}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::Error {
                error: "Invalid message format".into()
            }
        );
    }

    #[test]
    fn auth_failure_omits_absent_reason() {
        let value = serde_json::to_value(ServerMessage::AuthFailure {
            session_id: "A".into(),
            reason: None,
        })
        .unwrap();
        assert!(value.get("reason").is_none());
    }
}

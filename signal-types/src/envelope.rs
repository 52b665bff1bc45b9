//! Envelope - the text frame wrappers for inbound and outbound messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{ProtocolError, ServerMessage};

/// A parsed inbound text frame, before per-type validation.
///
/// Every field except `type` is optional here; [`crate::ClientMessage`]
/// decides which ones a given message type requires.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub kind: String,
    /// Client clock, informational only.
    #[serde(default)]
    pub timestamp: Option<serde_json::Number>,
    /// Target session (or auth session, in the host-authentication phase).
    #[serde(default)]
    pub session_id: Option<String>,
    /// Host identity.
    #[serde(default)]
    pub host_id: Option<String>,
    /// Sender-claimed client id. Ignored by the relay, which trusts only the
    /// connection the frame arrived on.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Session description offer (opaque).
    #[serde(default)]
    pub offer: Option<Value>,
    /// Session description answer (opaque).
    #[serde(default)]
    pub answer: Option<Value>,
    /// Reachability candidate (opaque).
    #[serde(default)]
    pub candidate: Option<Value>,
    /// One-time code for host authentication.
    #[serde(default, alias = "totp")]
    pub code: Option<String>,
    /// Free-form reason, used by `auth-failure`.
    #[serde(default)]
    pub reason: Option<String>,
}

impl InboundEnvelope {
    /// Parse a JSON text frame.
    ///
    /// Anything that is not a JSON object with a string `type` is
    /// [`ProtocolError::InvalidFormat`].
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|_| ProtocolError::InvalidFormat)
    }
}

/// A server message stamped with the relay's clock, ready for the wire.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame<'a> {
    /// The message body; its fields are inlined next to `timestamp`.
    #[serde(flatten)]
    pub message: &'a ServerMessage,
    /// Unix time in milliseconds when the frame was built.
    pub timestamp: u64,
}

impl<'a> OutboundFrame<'a> {
    /// Stamp a message with the current time.
    pub fn new(message: &'a ServerMessage) -> Self {
        Self {
            message,
            timestamp: unix_millis(),
        }
    }

    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Current Unix time in milliseconds (0 if the clock is before the epoch).
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionId;

    #[test]
    fn parse_minimal_envelope() {
        let env = InboundEnvelope::parse(r#"{"type":"heartbeat","timestamp":1700000000000}"#)
            .unwrap();
        assert_eq!(env.kind, "heartbeat");
        assert!(env.timestamp.is_some());
        assert!(env.session_id.is_none());
    }

    #[test]
    fn parse_camel_case_fields() {
        let env = InboundEnvelope::parse(
            r#"{"type":"register-host","sessionId":"S1","hostId":"H1"}"#,
        )
        .unwrap();
        assert_eq!(env.session_id.as_deref(), Some("S1"));
        assert_eq!(env.host_id.as_deref(), Some("H1"));
    }

    #[test]
    fn totp_alias_maps_to_code() {
        let env =
            InboundEnvelope::parse(r#"{"type":"verify-totp","sessionId":"A","totp":"123456"}"#)
                .unwrap();
        assert_eq!(env.code.as_deref(), Some("123456"));
    }

    #[test]
    fn parse_rejects_non_json() {
        assert_eq!(
            InboundEnvelope::parse("not json"),
            Err(ProtocolError::InvalidFormat)
        );
    }

    #[test]
    fn parse_rejects_missing_or_non_string_type() {
        assert_eq!(
            InboundEnvelope::parse(r#"{"sessionId":"S1"}"#),
            Err(ProtocolError::InvalidFormat)
        );
        assert_eq!(
            InboundEnvelope::parse(r#"{"type":42}"#),
            Err(ProtocolError::InvalidFormat)
        );
        assert_eq!(
            InboundEnvelope::parse(r#"["type","offer"]"#),
            Err(ProtocolError::InvalidFormat)
        );
    }

    #[test]
    fn outbound_frame_inlines_message_and_timestamp() {
        let msg = ServerMessage::HostRegistered {
            session_id: SessionId::from("S1"),
        };
        let json = OutboundFrame::new(&msg).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "host-registered");
        assert_eq!(value["sessionId"], "S1");
        assert!(value["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn outbound_frame_with_empty_variant() {
        let json = OutboundFrame::new(&ServerMessage::HeartbeatAck {})
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "heartbeat-ack");
        assert!(value["timestamp"].is_u64());
    }
}

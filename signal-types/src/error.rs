//! Error types reported back over the wire.

use thiserror::Error;

/// Errors produced while parsing or handling a client message.
///
/// The `Display` output of each variant is the exact `error` string sent to
/// the offending connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame is not a JSON object with a string `type`.
    #[error("Invalid message format")]
    InvalidFormat,

    /// The `type` is not one the relay understands.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// A required field for this message type is absent.
    #[error("{0}")]
    MissingField(&'static str),

    /// The referenced session does not exist.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The sender is not a participant of the referenced session.
    #[error("Not a participant of session: {0}")]
    NotParticipant(String),

    /// No host connection is registered under this host id.
    #[error("Host not found: {0}")]
    HostNotFound(String),

    /// The referenced auth session does not exist or has expired.
    #[error("Auth session not found: {0}")]
    AuthSessionNotFound(String),

    /// The sender holds the wrong role for this auth session.
    #[error("Not authorized for auth session: {0}")]
    NotAuthorized(String),

    /// Per-connection message quota exceeded.
    #[error("Rate limit exceeded")]
    RateLimited,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_strings() {
        assert_eq!(ProtocolError::InvalidFormat.to_string(), "Invalid message format");
        assert_eq!(
            ProtocolError::UnknownType("frobnicate".into()).to_string(),
            "Unknown message type: frobnicate"
        );
        assert_eq!(
            ProtocolError::SessionNotFound("S9".into()).to_string(),
            "Session not found: S9"
        );
        assert_eq!(
            ProtocolError::MissingField("Missing sessionId for join").to_string(),
            "Missing sessionId for join"
        );
        assert_eq!(
            ProtocolError::NotParticipant("S1".into()).to_string(),
            "Not a participant of session: S1"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}

//! In-memory connection handle for testing.
//!
//! Captures every frame, ping and close so tests can assert on exactly what
//! a connection would have received.

use super::{ConnectionHandle, TransportError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One captured outbound action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    /// A text frame.
    Text(String),
    /// A keep-alive ping.
    Ping,
    /// A close frame.
    Close {
        /// Status code.
        code: u16,
        /// Reason text.
        reason: String,
    },
}

#[derive(Debug, Default)]
struct MockHandleInner {
    closed: bool,
    sent: Vec<Sent>,
    fail_sends: Option<String>,
}

/// Recording handle. Clones share the same capture buffer.
#[derive(Debug, Default, Clone)]
pub struct MockHandle {
    inner: Arc<Mutex<MockHandleInner>>,
}

impl MockHandle {
    /// Create a new open handle.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockHandleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every captured action, in order.
    pub fn sent(&self) -> Vec<Sent> {
        self.lock().sent.clone()
    }

    /// Captured text frames parsed as JSON.
    pub fn frames(&self) -> Vec<serde_json::Value> {
        self.lock()
            .sent
            .iter()
            .filter_map(|s| match s {
                Sent::Text(text) => serde_json::from_str(text).ok(),
                _ => None,
            })
            .collect()
    }

    /// Captured frames whose `type` equals `kind`.
    pub fn frames_of(&self, kind: &str) -> Vec<serde_json::Value> {
        self.frames()
            .into_iter()
            .filter(|f| f["type"] == kind)
            .collect()
    }

    /// Number of pings received.
    pub fn pings(&self) -> usize {
        self.lock().sent.iter().filter(|s| **s == Sent::Ping).count()
    }

    /// The close frame, if one was sent.
    pub fn close_frame(&self) -> Option<(u16, String)> {
        self.lock().sent.iter().find_map(|s| match s {
            Sent::Close { code, reason } => Some((*code, reason.clone())),
            _ => None,
        })
    }

    /// Drop all captured actions.
    pub fn clear(&self) {
        self.lock().sent.clear();
    }

    /// Simulate the peer going away without a close handshake.
    pub fn drop_connection(&self) {
        self.lock().closed = true;
    }

    /// Make every subsequent send fail with the given error while still
    /// reporting the connection as open.
    pub fn fail_sends(&self, error: &str) {
        self.lock().fail_sends = Some(error.to_string());
    }
}

impl ConnectionHandle for MockHandle {
    fn is_open(&self) -> bool {
        !self.lock().closed
    }

    fn send(&self, text: String) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(TransportError::ConnectionClosed);
        }
        if let Some(error) = &inner.fail_sends {
            return Err(TransportError::SendFailed(error.clone()));
        }
        inner.sent.push(Sent::Text(text));
        Ok(())
    }

    fn ping(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(TransportError::ConnectionClosed);
        }
        inner.sent.push(Sent::Ping);
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.sent.push(Sent::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_frames_in_order() {
        let handle = MockHandle::new();
        handle.send(r#"{"type":"a"}"#.to_string()).unwrap();
        handle.ping().unwrap();
        handle.send(r#"{"type":"b"}"#.to_string()).unwrap();

        assert_eq!(handle.frames().len(), 2);
        assert_eq!(handle.frames_of("b").len(), 1);
        assert_eq!(handle.pings(), 1);
    }

    #[test]
    fn close_is_idempotent_and_blocks_sends() {
        let handle = MockHandle::new();
        handle.close(1001, "bye");
        handle.close(1000, "again");

        assert!(!handle.is_open());
        assert_eq!(handle.close_frame(), Some((1001, "bye".to_string())));
        assert_eq!(
            handle.send("x".to_string()),
            Err(TransportError::ConnectionClosed)
        );
    }

    #[test]
    fn failing_sends_report_error_but_stay_open() {
        let handle = MockHandle::new();
        handle.fail_sends("broken pipe");
        assert!(handle.is_open());
        assert_eq!(
            handle.send("x".to_string()),
            Err(TransportError::SendFailed("broken pipe".to_string()))
        );
    }

    #[test]
    fn clones_share_capture() {
        let handle = MockHandle::new();
        let clone = handle.clone();
        clone.send(r#"{"type":"a"}"#.to_string()).unwrap();
        assert_eq!(handle.frames().len(), 1);
    }
}

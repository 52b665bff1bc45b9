//! Transport abstraction for signal-relay.
//!
//! The registry never touches sockets directly. Each accepted connection is
//! represented by a [`ConnectionHandle`], a minimal capability object:
//! - `is_open()` reports whether the peer can still receive
//! - `send()` queues one text frame
//! - `ping()` queues a transport-level keep-alive probe
//! - `close()` queues a close frame with a status code
//!
//! All methods are non-blocking; a socket writer task (or a test double)
//! performs the actual I/O.

mod mock;
pub mod websocket;

pub use mock::{MockHandle, Sent};

use thiserror::Error;

/// Close status used when the relay shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Close status used when the reaper evicts a silent connection.
pub const CLOSE_NORMAL: u16 = 1000;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Capability to talk to one accepted connection.
pub trait ConnectionHandle: Send + Sync {
    /// Whether the connection can still accept outbound frames.
    fn is_open(&self) -> bool;

    /// Queue a text frame.
    fn send(&self, text: String) -> Result<(), TransportError>;

    /// Queue a keep-alive ping.
    fn ping(&self) -> Result<(), TransportError>;

    /// Queue a close frame. Idempotent.
    fn close(&self, code: u16, reason: &str);
}

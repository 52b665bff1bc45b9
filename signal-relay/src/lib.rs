//! # signal-relay
//!
//! In-memory signaling relay for peer-to-peer connection setup.
//!
//! Peers connect over WebSocket, group into sessions by an opaque session
//! id, and use the relay to exchange connection offers, answers and
//! reachability candidates. The relay never inspects those payloads and
//! keeps nothing on disk.
//!
//! ## Architecture
//!
//! ```text
//! Peer A ──┐                    ┌── Peer B
//!          │     WebSocket      │
//!      ┌───┴────────────────────┴───┐
//!      │  transport      timers     │
//!      │       └──► event loop ◄──┘ │
//!      │              │             │
//!      │   router ──► registry      │
//!      └────────────────────────────┘
//! ```
//!
//! One task owns the registry; sockets, timers and HTTP handlers reach it
//! through a [`server::RelayHandle`].
//!
//! ## Protocol
//!
//! Generic relay: `register-host`, `join-session`, `offer`, `answer`,
//! `ice-candidate`, `heartbeat`. Host authentication: `connect-to-host`,
//! `verify-totp`, `auth-success`, `auth-failure`, `webrtc-offer`,
//! `webrtc-answer`, `webrtc-ice-candidate`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod server;
pub mod transport;

pub use config::Config;
pub use error::{RelayError, Result};
pub use server::{RelayHandle, SignalRelay};

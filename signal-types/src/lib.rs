//! # signal-types
//!
//! Wire format types for the p2p-signal rendezvous protocol.
//!
//! This crate provides the types shared by the relay and its clients:
//! - [`ConnectionId`], [`SessionId`], [`HostId`] - Identity types
//! - [`InboundEnvelope`], [`OutboundFrame`] - Text frame wrappers
//! - [`ClientMessage`], [`ServerMessage`] - Protocol messages
//! - [`ProtocolError`] - Errors reported back to the sender

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod ids;
mod messages;

pub use envelope::{unix_millis, InboundEnvelope, OutboundFrame};
pub use error::ProtocolError;
pub use ids::{ConnectionId, HostId, SessionId};
pub use messages::{ClientMessage, ServerMessage};

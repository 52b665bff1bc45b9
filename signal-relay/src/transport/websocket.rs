//! WebSocket transport adapter.
//!
//! Each upgraded socket is split in two: a writer task draining a
//! [`WsHandle`] queue, and the handler loop forwarding inbound frames to the
//! relay as events in arrival order. Once the writer finishes (close frame
//! sent, write error, or a forced close) the handler stops reading and the
//! socket is dropped, whether or not the peer answered the close handshake.

use super::{ConnectionHandle, TransportError};
use crate::server::RelayHandle;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::{header::ORIGIN, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use futures_util::{SinkExt, StreamExt};
use signal_types::ConnectionId;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Outbound frames buffered per socket before sends start failing.
const OUTBOUND_QUEUE: usize = 256;

/// Work queued for a socket's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outbound {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

/// [`ConnectionHandle`] backed by a WebSocket writer task.
#[derive(Debug, Clone)]
pub struct WsHandle {
    tx: mpsc::Sender<Outbound>,
    force_close: Arc<Notify>,
}

impl WsHandle {
    fn queue(&self, out: Outbound) -> Result<(), TransportError> {
        self.tx.try_send(out).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::SendFailed("outbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }
}

impl ConnectionHandle for WsHandle {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send(&self, text: String) -> Result<(), TransportError> {
        self.queue(Outbound::Text(text))
    }

    fn ping(&self) -> Result<(), TransportError> {
        self.queue(Outbound::Ping)
    }

    fn close(&self, code: u16, reason: &str) {
        let queued = self.queue(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        // A backed-up writer is torn down without the close frame.
        if let Err(TransportError::SendFailed(_)) = queued {
            self.force_close.notify_one();
        }
    }
}

/// `GET /ws` (and `GET /`) upgrade handler.
///
/// Refuses disallowed origins with 403 and upgrades past
/// `limits.max_connections` with 503. Requests without an `Origin` header
/// are native clients and are let through.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Extension(relay): Extension<RelayHandle>,
) -> Response {
    if let Some(origin) = headers.get(ORIGIN) {
        let allowed = origin
            .to_str()
            .map(|o| relay.config().cors.allows(o))
            .unwrap_or(false);
        if !allowed {
            tracing::warn!(origin = ?origin, "Rejected WebSocket upgrade from disallowed origin");
            return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    }

    if !relay.has_capacity() {
        tracing::warn!("Rejected WebSocket upgrade: connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

async fn handle_socket(socket: WebSocket, relay: RelayHandle) {
    let connection_id = ConnectionId::new();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    let force_close = Arc::new(Notify::new());
    let handle = WsHandle {
        tx,
        force_close: force_close.clone(),
    };

    if relay.connected(connection_id, Arc::new(handle)).await.is_err() {
        tracing::debug!(connection_id = %connection_id, "Relay stopped before connection registered");
        let _ = sink.close().await;
        return;
    }

    let mut writer = tokio::spawn(async move {
        loop {
            let out = tokio::select! {
                out = rx.recv() => match out {
                    Some(out) => out,
                    None => break,
                },
                _ = force_close.notified() => {
                    tracing::debug!(connection_id = %connection_id, "Outbound queue full, dropping socket");
                    break;
                }
            };
            let (message, last) = match out {
                Outbound::Text(text) => (Message::Text(text), false),
                Outbound::Ping => (Message::Ping(Vec::new()), false),
                Outbound::Close { code, reason } => (
                    Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })),
                    true,
                ),
            };
            if let Err(e) = sink.send(message).await {
                tracing::debug!(connection_id = %connection_id, "WebSocket write failed: {}", e);
                break;
            }
            if last {
                break;
            }
        }
        // Dropping `rx` here flips the handle's `is_open` to false.
    });

    loop {
        let result = tokio::select! {
            next = stream.next() => match next {
                Some(result) => result,
                None => break,
            },
            _ = &mut writer => {
                tracing::debug!(connection_id = %connection_id, "Writer finished, dropping socket");
                break;
            }
        };
        let forwarded = match result {
            Ok(Message::Text(text)) => relay.frame(connection_id, text).await,
            Ok(Message::Binary(_)) => relay.unsupported(connection_id).await,
            Ok(Message::Pong(_)) => relay.pong(connection_id).await,
            Ok(Message::Ping(_)) => Ok(()),
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, "WebSocket error: {}", e);
                break;
            }
        };
        if forwarded.is_err() {
            break;
        }
    }
    writer.abort();

    tracing::debug!(connection_id = %connection_id, "WebSocket closed");
    let _ = relay.closed(connection_id).await;
}

//! Real-time transport: one WebSocket per device connection.
//!
//! Each connection runs two tasks — this task reads inbound frames, a
//! spawned task drains the bounded outbound queue into the socket. Neither
//! touches the key-distribution path. Registration happens before the first
//! frame; unregistration on transport close, read error, or force-disconnect
//! by the hub.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use courier_hub::{ConnectionHandle, Delivery};
use courier_protocol::{ClientFrame, ServerFrame};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::state::{ServerState, SharedState};

#[derive(Deserialize)]
pub struct WsParams {
    /// Authenticated identity of the connecting client. Browsers cannot set
    /// headers on a WebSocket upgrade, so the gateway rewrites the verified
    /// identity into this query parameter.
    #[serde(default)]
    pub user_id: String,
}

/// `GET /ws` — upgrade to the persistent connection.
pub async fn ws_handler(
    State(state): State<SharedState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if params.user_id.is_empty() {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    ws.on_upgrade(move |socket| client_connection(state, params.user_id, socket))
}

async fn client_connection(state: SharedState, user_id: String, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    let (handle, mut rx) = state.registry.open(&user_id);
    let came_online = match state.registry.register(&handle) {
        Ok(came_online) => came_online,
        Err(e) => {
            tracing::error!(user = %user_id, error = %e, "registration failed");
            return;
        }
    };
    tracing::info!(user = %user_id, connection = handle.id(), "client connected");

    if came_online {
        let _ = state.hub.broadcast_signal(&ServerFrame::Presence {
            user_id: user_id.clone(),
            online: true,
        });
    }

    deliver_pending(&state, &handle);

    // Writer: drains the bounded queue; the close signal wakes it when the
    // registry drops this handle so a force-disconnect is not stuck behind
    // an idle queue.
    let writer_handle = Arc::clone(&handle);
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping unencodable frame");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                () = writer_handle.closed() => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    // Reader: this task.
    while let Some(incoming) = stream.next().await {
        match incoming {
            Ok(Message::Text(text)) => handle_inbound_frame(&state, &user_id, text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // ping/pong handled by axum; binary frames ignored
            Err(e) => {
                tracing::debug!(user = %user_id, error = %e, "transport read error");
                break;
            }
        }
    }

    let outcome = state.registry.unregister(&handle);
    if outcome.went_offline {
        // Last-seen bookkeeping hangs off this transition elsewhere.
        tracing::info!(user = %user_id, "user went offline");
        let _ = state.hub.broadcast_signal(&ServerFrame::Presence {
            user_id: user_id.clone(),
            online: false,
        });
    }
    let _ = writer.await;
    tracing::info!(user = %user_id, connection = handle.id(), "client disconnected");
}

/// Route one inbound frame from an authenticated connection.
///
/// Message envelopes go to their explicit recipient only; a recipient with
/// no live connection gets the envelope persisted instead. Typing
/// indicators are the sole client-originated broadcast. Malformed frames
/// are logged and dropped — the transport carries no error responses.
pub fn handle_inbound_frame(state: &ServerState, sender_id: &str, raw: &str) {
    let frame = match ClientFrame::decode(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(user = %sender_id, error = %e, "dropping malformed frame");
            return;
        }
    };

    match frame {
        ClientFrame::Message { to, mut envelope } => {
            envelope.sender_id = sender_id.to_string();
            if envelope.created_at == 0 {
                envelope.created_at = timestamp_now_ms();
            }
            if let Err(e) = envelope.validate() {
                tracing::warn!(user = %sender_id, error = %e, "dropping invalid envelope");
                return;
            }

            match state.hub.send(&to, &ServerFrame::Message { envelope: envelope.clone() }) {
                Delivery::Delivered(connections) => {
                    tracing::trace!(from = %sender_id, to = %to, connections, "envelope delivered");
                }
                Delivery::Offline => {
                    if let Err(e) = state.pending.enqueue(&to, &envelope) {
                        tracing::error!(from = %sender_id, to = %to, error = %e, "failed to persist envelope for offline recipient");
                    } else {
                        tracing::debug!(from = %sender_id, to = %to, "recipient offline, envelope persisted");
                    }
                }
            }
        }
        ClientFrame::Typing { chat_id, typing } => {
            let _ = state.hub.broadcast_signal(&ServerFrame::Typing {
                chat_id,
                user_id: sender_id.to_string(),
                typing,
            });
        }
    }
}

/// Drain envelopes stored while the user was offline into a fresh
/// connection's queue, oldest first. Whatever does not fit goes back to the
/// store for the next connection.
pub fn deliver_pending(state: &ServerState, handle: &Arc<ConnectionHandle>) {
    let envelopes = match state.pending.take_for(handle.user_id()) {
        Ok(envelopes) => envelopes,
        Err(e) => {
            tracing::error!(user = %handle.user_id(), error = %e, "failed to load pending envelopes");
            return;
        }
    };
    if envelopes.is_empty() {
        return;
    }

    let total = envelopes.len();
    let mut delivered = 0;
    let mut iter = envelopes.into_iter();
    for envelope in iter.by_ref() {
        if handle
            .enqueue(ServerFrame::Message { envelope: envelope.clone() })
            .is_err()
        {
            if let Err(e) = state.pending.enqueue(handle.user_id(), &envelope) {
                tracing::error!(user = %handle.user_id(), error = %e, "failed to requeue pending envelope");
            }
            break;
        }
        delivered += 1;
    }
    for envelope in iter {
        if let Err(e) = state.pending.enqueue(handle.user_id(), &envelope) {
            tracing::error!(user = %handle.user_id(), error = %e, "failed to requeue pending envelope");
        }
    }

    tracing::debug!(
        user = %handle.user_id(),
        delivered,
        requeued = total - delivered,
        "pending envelopes drained"
    );
}

fn timestamp_now_ms() -> u64 {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or_default()
}

//! WebSocket endpoint: authenticate, register presence, pump frames.

use std::time::{Duration, Instant};

use axum::extract::ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use screenflow_core::identity::Participant;
use screenflow_core::ids::ConnectionId;

use crate::gateway::authenticate;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL};
use crate::server::AppState;
use crate::wire::{ClientFrame, WireEvent};

/// Interval between server-initiated Ping frames. Pongs count as activity.
const PING_INTERVAL: Duration = Duration::from_secs(30);

const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// GET /ws. The caller is authenticated before the upgrade.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let participant = match authenticate(&state, &headers, params.token).await {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    match upgrade {
        Ok(upgrade) => upgrade
            .on_upgrade(move |socket| run_connection(socket, state, participant))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

#[instrument(skip_all, fields(participant_id = %participant.id))]
async fn run_connection(socket: WebSocket, state: AppState, participant: Participant) {
    let (conn_id, mut outbox) = state.presence.connect(participant.clone());
    let started = Instant::now();
    info!(connection_id = %conn_id, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let established = WireEvent::new(
        "connection.established",
        None,
        serde_json::json!({ "connection_id": conn_id, "participant": participant }),
    );
    let _ = state.presence.send_to(&conn_id, &established);

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Ends when the registry drops the sender (disconnect or idle eviction)
    // or the socket stops accepting writes.
    let mut outbound = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        let _ = ping.tick().await;
        loop {
            tokio::select! {
                frame = outbox.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(Message::Text(frame.as_str().to_owned().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let outbound_finished = loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break false };
                match msg {
                    Message::Text(text) => handle_frame(&state, &conn_id, text.as_str()).await,
                    Message::Binary(data) => match std::str::from_utf8(&data) {
                        Ok(text) => handle_frame(&state, &conn_id, text).await,
                        Err(_) => reject(&state, &conn_id, "frame is not valid UTF-8"),
                    },
                    Message::Ping(_) | Message::Pong(_) => state.presence.touch(&conn_id),
                    Message::Close(_) => {
                        debug!(connection_id = %conn_id, "client sent close frame");
                        break false;
                    }
                }
            }
            _ = &mut outbound => break true,
            () = state.shutdown.cancelled() => break false,
        }
    };

    let dropped = state.presence.dropped_for(&conn_id);
    // Dropping the registry's sender lets the writer flush and send Close.
    let _ = state.presence.disconnect(&conn_id);
    if !outbound_finished && tokio::time::timeout(CLOSE_GRACE, &mut outbound).await.is_err() {
        outbound.abort();
    }
    info!(connection_id = %conn_id, dropped, "client disconnected");
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(started.elapsed().as_secs_f64());
}

async fn handle_frame(state: &AppState, conn_id: &ConnectionId, text: &str) {
    state.presence.touch(conn_id);
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            reject(state, conn_id, &format!("unsupported frame: {e}"));
            return;
        }
    };
    match frame {
        ClientFrame::JoinRoom { session_id } => match state.engine.get_session(&session_id).await {
            Ok(_) => {
                let _ = state.presence.join_room(conn_id, &session_id);
            }
            Err(e) => {
                let _ = state
                    .presence
                    .send_to(conn_id, &WireEvent::error(e.error_kind(), e.to_string()));
            }
        },
        ClientFrame::LeaveRoom { session_id } => {
            let _ = state.presence.leave_room(conn_id, &session_id);
        }
        ClientFrame::Ping => {
            let _ = state
                .presence
                .send_to(conn_id, &WireEvent::new("pong", None, serde_json::json!({})));
        }
    }
}

fn reject(state: &AppState, conn_id: &ConnectionId, message: &str) {
    debug!(connection_id = %conn_id, message, "rejected client frame");
    let _ = state
        .presence
        .send_to(conn_id, &WireEvent::error("bad_frame", message));
}

//! `WS /api/sessions/{id}/stream` — upgrades the connection, looks up the
//! session, then bridges the socket halves into the channel pair the
//! streaming pipeline talks to, grounded on the original's
//! `routers/stream.py::depth_stream`.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::AppState;

/// Policy-violation close code, matching the original's
/// `websocket.close(code=1008)` on an unknown session id.
const CLOSE_UNKNOWN_SESSION: u16 = 1008;

pub async fn depth_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn handle_socket(socket: WebSocket, session_id: String, state: AppState) {
    let Some(session) = state.manager.get(&session_id).await else {
        let (mut sender, _receiver) = socket.split();
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_UNKNOWN_SESSION,
                reason: "session not found".into(),
            })))
            .await;
        return;
    };

    info!(session_id = %session_id, "depth stream connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (incoming_tx, incoming_rx) = mpsc::channel::<String>(32);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(32);

    let handle = depth_core::pipeline::spawn(
        state.manager.clone(),
        session,
        state.engine.clone(),
        state.settings.clone(),
        incoming_rx,
        outgoing_tx,
    );
    let stop = handle.stop.clone();

    // Bridges outgoing binary payloads from the pipeline onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(payload) = outgoing_rx.recv().await {
            if ws_sender.send(Message::Binary(payload)).await.is_err() {
                break;
            }
        }
    });

    // Reads text frames off the socket into the pipeline's request queue
    // until the client disconnects or sends something unexpected.
    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if incoming_tx.send(text).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(session_id = %session_id, %err, "websocket receive error");
                break;
            }
        }
    }

    drop(incoming_tx);
    let _ = stop.send(true);
    handle.join().await;
    let _ = writer.await;

    info!(session_id = %session_id, "depth stream disconnected");
}

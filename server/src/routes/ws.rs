//! WebSocket handler: per-session event relay.
//!
//! DESIGN
//! ======
//! On upgrade the connection joins its session room and enters a `select!`
//! loop:
//! - Incoming client text → validate as an event for this session → fan out
//!   to every other member
//! - Frames from peers → forward to the client
//!
//! The sender never receives its own frame back; clients suppress
//! self-echo anyway, so this only saves traffic.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade (requires `client_id` query parameter) → join room
//! 2. Client frames relayed until close or socket error
//! 3. Part room; an empty room is dropped

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sessionboard::event::ErrorCode;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::services::relay;
use crate::state::AppState;

const CLIENT_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(client_id) = params.get("client_id").filter(|v| !v.is_empty()).cloned() else {
        return (StatusCode::BAD_REQUEST, "client_id required").into_response();
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, session_id, client_id))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, session_id: String, client_id: String) {
    let conn_id = Uuid::new_v4();
    let (client_tx, mut client_rx) = mpsc::channel::<String>(CLIENT_QUEUE_CAPACITY);
    relay::join(&state, &session_id, conn_id, client_tx).await;
    info!(%session_id, %client_id, %conn_id, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        process_inbound_text(&state, &session_id, conn_id, text.as_str()).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(text) = client_rx.recv() => {
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    relay::part(&state, &session_id, conn_id).await;
    info!(%session_id, %client_id, %conn_id, "ws: client disconnected");
}

/// Validate one inbound frame and relay it to peers. Returns how many peers
/// accepted it; invalid frames are dropped.
async fn process_inbound_text(state: &AppState, session_id: &str, conn_id: Uuid, text: &str) -> usize {
    match relay::accept_frame(session_id, text) {
        Ok(event) => {
            let delivered = relay::broadcast(state, session_id, text, Some(conn_id)).await;
            debug!(
                %session_id,
                %conn_id,
                event_type = %event.event_type(),
                version = ?event.version,
                delivered,
                "ws: relayed event"
            );
            delivered
        }
        Err(e) => {
            warn!(%session_id, %conn_id, code = e.error_code(), error = %e, "ws: dropping invalid frame");
            0
        }
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;

//! Relay service: per-session fan-out of sync events between sockets.
//!
//! DESIGN
//! ======
//! The relay forwards event text untouched. It decodes each frame only to
//! check that it is a well-formed event for the room it arrived on; it never
//! interprets versions or payloads. Delivery is best-effort and at-most-once:
//! a member whose queue is full misses the frame, and nothing is replayed to
//! late joiners. Clients resync through `state.request` on reconnect.

use sessionboard::event::{ErrorCode, EventError, SyncEvent};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::state::{AppState, SessionRoom};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("undecodable event: {0}")]
    Decode(#[from] EventError),
    #[error("event for session {got} sent on session {expected}")]
    SessionMismatch { expected: String, got: String },
}

impl ErrorCode for RelayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Decode(e) => e.error_code(),
            Self::SessionMismatch { .. } => "E_SESSION_MISMATCH",
        }
    }
}

/// Add a connection to a session room, creating the room if needed.
pub async fn join(state: &AppState, session_id: &str, conn_id: Uuid, tx: mpsc::Sender<String>) {
    let mut rooms = state.rooms.write().await;
    let room = rooms.entry(session_id.to_owned()).or_insert_with(SessionRoom::new);
    room.clients.insert(conn_id, tx);
    info!(%session_id, %conn_id, members = room.clients.len(), "relay: client joined");
}

/// Remove a connection. Empty rooms are dropped.
pub async fn part(state: &AppState, session_id: &str, conn_id: Uuid) {
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(session_id) else {
        return;
    };
    room.clients.remove(&conn_id);
    info!(%session_id, %conn_id, remaining = room.clients.len(), "relay: client left");
    if room.clients.is_empty() {
        rooms.remove(session_id);
    }
}

/// Send `text` to every member except `exclude`. Returns how many members
/// accepted it.
pub async fn broadcast(state: &AppState, session_id: &str, text: &str, exclude: Option<Uuid>) -> usize {
    let rooms = state.rooms.read().await;
    let Some(room) = rooms.get(session_id) else {
        return 0;
    };

    let mut delivered = 0;
    for (conn_id, tx) in &room.clients {
        if exclude == Some(*conn_id) {
            continue;
        }
        // Best-effort: if a client's channel is full, skip it.
        if tx.try_send(text.to_owned()).is_ok() {
            delivered += 1;
        } else {
            debug!(%session_id, %conn_id, "relay: member queue full or closed; frame dropped");
        }
    }
    delivered
}

pub async fn member_count(state: &AppState, session_id: &str) -> usize {
    state.rooms.read().await.get(session_id).map_or(0, |room| room.clients.len())
}

/// Check that `text` is an event addressed to `session_id`.
///
/// # Errors
///
/// Undecodable text, or an event naming a different session.
pub fn accept_frame(session_id: &str, text: &str) -> Result<SyncEvent, RelayError> {
    let event = SyncEvent::decode(text)?;
    if event.session_id != session_id {
        return Err(RelayError::SessionMismatch { expected: session_id.to_owned(), got: event.session_id });
    }
    Ok(event)
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;

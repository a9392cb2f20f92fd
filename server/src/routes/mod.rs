//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! Binds the relay websocket, the session write-through, checkpoint export,
//! and health check under one Axum router.

pub mod sessions;
pub mod ws;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Room for the JSON document that travels next to the preview.
const SNAPSHOT_DOCUMENT_HEADROOM_BYTES: usize = 2 * 1024 * 1024;

/// Request body cap for checkpoint export: a base64 preview at the configured
/// maximum plus the document. Sized above the preview cap so oversized
/// previews reach the checkpoint validator and get a structured error.
#[must_use]
pub fn snapshot_body_limit(max_preview_bytes: usize) -> usize {
    max_preview_bytes
        .div_ceil(3)
        .saturating_mul(4)
        .saturating_add(SNAPSHOT_DOCUMENT_HEADROOM_BYTES)
}

pub fn app(state: AppState) -> Router {
    let snapshot_limit = snapshot_body_limit(state.limits.max_preview_bytes);
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/sessions/{id}", get(sessions::get_session).put(sessions::put_session))
        .route(
            "/sessions/{id}/snapshots",
            post(sessions::create_snapshot)
                .layer(DefaultBodyLimit::max(snapshot_limit))
                .get(sessions::list_snapshots),
        )
        .route("/sessions/{id}/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

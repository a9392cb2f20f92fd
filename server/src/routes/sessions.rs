//! Session document and checkpoint routes.
//!
//! Errors render as `{code, message, retryable}` JSON so clients can decide
//! whether to retry without parsing messages.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;
use sessionboard::event::ErrorCode;
use sessionboard::persistence::CheckpointInfo;
use tracing::error;

use crate::services::checkpoint::{self, CheckpointError, CheckpointRequest};
use crate::services::session::{self, SessionError, WriteRequest, WriteResult};
use crate::state::AppState;

/// Optional caller identity, recorded with each write. Authentication is
/// handled upstream.
pub const USER_ID_HEADER: &str = "x-user-id";

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ApiError {
    fn from_code(status: StatusCode, err: &impl ErrorCode) -> Self {
        if status.is_server_error() {
            error!(code = err.error_code(), error = %err, "request failed");
        }
        Self { status, code: err.error_code(), message: err.to_string(), retryable: err.retryable() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match err {
            SessionError::InvalidDocument(_) => StatusCode::BAD_REQUEST,
            SessionError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::from_code(status, &err)
    }
}

impl From<CheckpointError> for ApiError {
    fn from(err: CheckpointError) -> Self {
        let status = match err {
            CheckpointError::EmptyName
            | CheckpointError::NameTooLong
            | CheckpointError::InvalidDocument
            | CheckpointError::InvalidPreview(_) => StatusCode::BAD_REQUEST,
            CheckpointError::PreviewTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            CheckpointError::LimitReached { .. } => StatusCode::CONFLICT,
            CheckpointError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::from_code(status, &err)
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

/// `GET /sessions/{id}`: the stored document, or `null`.
pub async fn get_session(State(state): State<AppState>, Path(session_id): Path<String>) -> Result<Json<Value>, ApiError> {
    let data = session::load_session(&state, &session_id).await?;
    Ok(Json(data.unwrap_or(Value::Null)))
}

/// `PUT /sessions/{id}`: 202 when queued, 200 `{updated_at}` when written.
pub async fn put_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<WriteRequest>,
) -> Result<Response, ApiError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    match session::write_session(&state, &session_id, request, user_id).await? {
        WriteResult::Queued => Ok(StatusCode::ACCEPTED.into_response()),
        WriteResult::Written { updated_at, applied } => Ok((
            StatusCode::OK,
            Json(serde_json::json!({
                "updated_at": session::format_timestamp(updated_at),
                "applied": applied,
            })),
        )
            .into_response()),
    }
}

/// `POST /sessions/{id}/snapshots`
pub async fn create_snapshot(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<CheckpointRequest>,
) -> Result<(StatusCode, Json<CheckpointInfo>), ApiError> {
    let info = checkpoint::create_checkpoint(&state, &session_id, request).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

/// `GET /sessions/{id}/snapshots`
pub async fn list_snapshots(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<CheckpointInfo>>, ApiError> {
    Ok(Json(checkpoint::list_checkpoints(&state, &session_id).await?))
}

#[cfg(test)]
#[path = "sessions_test.rs"]
mod tests;

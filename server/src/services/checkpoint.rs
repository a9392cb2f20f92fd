//! Checkpoint service: named, on-demand session snapshots.
//!
//! DESIGN
//! ======
//! Checkpoints are outside the continuous sync loop. Each stores the full
//! document plus an optional PNG preview, and two caps bound storage per
//! session: a maximum checkpoint count and a maximum preview size. Caps are
//! checked before anything is written.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::Value;
use sessionboard::doc::CanvasState;
use sessionboard::event::ErrorCode;
use sessionboard::persistence::CheckpointInfo;
use time::format_description::well_known::Rfc3339;
use tracing::info;

use crate::db::{NewSnapshot, SnapshotRow};
use crate::services::persistence::env_parse;
use crate::state::AppState;

const DEFAULT_SNAPSHOT_MAX_PER_SESSION: i64 = 20;
const DEFAULT_SNAPSHOT_MAX_PREVIEW_BYTES: usize = 2 * 1024 * 1024;
const MAX_NAME_CHARS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint name must not be empty")]
    EmptyName,
    #[error("checkpoint name exceeds {MAX_NAME_CHARS} characters")]
    NameTooLong,
    #[error("checkpoint data must be a JSON object")]
    InvalidDocument,
    #[error("preview is not valid base64: {0}")]
    InvalidPreview(#[from] base64::DecodeError),
    #[error("preview is {size} bytes; limit is {max}")]
    PreviewTooLarge { size: usize, max: usize },
    #[error("session already has {max} checkpoints")]
    LimitReached { max: i64 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for CheckpointError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyName | Self::NameTooLong => "E_CHECKPOINT_NAME",
            Self::InvalidDocument => "E_INVALID_DOCUMENT",
            Self::InvalidPreview(_) => "E_CHECKPOINT_PREVIEW",
            Self::PreviewTooLarge { .. } => "E_CHECKPOINT_PREVIEW_TOO_LARGE",
            Self::LimitReached { .. } => "E_CHECKPOINT_LIMIT",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Per-session storage caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointLimits {
    pub max_per_session: i64,
    pub max_preview_bytes: usize,
}

impl Default for CheckpointLimits {
    fn default() -> Self {
        Self { max_per_session: DEFAULT_SNAPSHOT_MAX_PER_SESSION, max_preview_bytes: DEFAULT_SNAPSHOT_MAX_PREVIEW_BYTES }
    }
}

impl CheckpointLimits {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            max_per_session: env_parse("SNAPSHOT_MAX_PER_SESSION", DEFAULT_SNAPSHOT_MAX_PER_SESSION),
            max_preview_bytes: env_parse("SNAPSHOT_MAX_PREVIEW_BYTES", DEFAULT_SNAPSHOT_MAX_PREVIEW_BYTES),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckpointRequest {
    pub name: String,
    pub data: Value,
    /// Base64-encoded PNG.
    #[serde(default)]
    pub preview_png: Option<String>,
}

/// Validate and store a checkpoint.
///
/// # Errors
///
/// Validation and cap violations, or a database failure.
pub async fn create_checkpoint(
    state: &AppState,
    session_id: &str,
    request: CheckpointRequest,
) -> Result<CheckpointInfo, CheckpointError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(CheckpointError::EmptyName);
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(CheckpointError::NameTooLong);
    }
    let document = CanvasState::from_value(&request.data).ok_or(CheckpointError::InvalidDocument)?;
    let data = serde_json::to_value(&document).map_err(|_| CheckpointError::InvalidDocument)?;
    let preview_png = decode_preview(request.preview_png.as_deref(), state.limits.max_preview_bytes)?;

    let existing = state.repo.count_snapshots(session_id).await?;
    if existing >= state.limits.max_per_session {
        return Err(CheckpointError::LimitReached { max: state.limits.max_per_session });
    }

    let row = state
        .repo
        .insert_snapshot(NewSnapshot { session_id: session_id.to_owned(), name: name.to_owned(), data, preview_png })
        .await?;
    info!(%session_id, checkpoint_id = %row.id, has_preview = row.has_preview, "checkpoint stored");
    Ok(to_info(row))
}

/// List checkpoints, newest first.
///
/// # Errors
///
/// Database failure.
pub async fn list_checkpoints(state: &AppState, session_id: &str) -> Result<Vec<CheckpointInfo>, CheckpointError> {
    let rows = state.repo.list_snapshots(session_id).await?;
    Ok(rows.into_iter().map(to_info).collect())
}

pub(crate) fn decode_preview(encoded: Option<&str>, max_bytes: usize) -> Result<Option<Vec<u8>>, CheckpointError> {
    let Some(encoded) = encoded.filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    // Reject before decoding when the encoded text alone implies too many bytes.
    let estimated = encoded.len() / 4 * 3;
    if estimated > max_bytes + 2 {
        return Err(CheckpointError::PreviewTooLarge { size: estimated, max: max_bytes });
    }
    let bytes = BASE64.decode(encoded)?;
    if bytes.len() > max_bytes {
        return Err(CheckpointError::PreviewTooLarge { size: bytes.len(), max: max_bytes });
    }
    Ok(Some(bytes))
}

fn to_info(row: SnapshotRow) -> CheckpointInfo {
    CheckpointInfo {
        id: row.id,
        name: row.name,
        created_at: row.created_at.format(&Rfc3339).unwrap_or_default(),
        has_preview: row.has_preview,
    }
}

#[cfg(test)]
#[path = "checkpoint_test.rs"]
mod tests;

//! Session documents: the write-through behind `PUT`/`GET /sessions/{id}`.
//!
//! DESIGN
//! ======
//! A write is normalized through the shared document model, then either
//! queued for the checkpoint worker (202) or, when there is no queue or it
//! rejects the message, written synchronously (200 with the canonical
//! `updated_at`). A stored document is never replaced by a lower version.
//!
//! Loads stamp the row's `version`/`updated_at` into the returned document so
//! a client seeds its watermark from what was actually stored.

use serde::Deserialize;
use serde_json::Value;
use sessionboard::doc::CanvasState;
use sessionboard::event::ErrorCode;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info};

use crate::services::persistence::{CheckpointMessage, enqueue_checkpoint};
use crate::state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session document: {0}")]
    InvalidDocument(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidDocument(_) => "E_INVALID_DOCUMENT",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Body of `PUT /sessions/{id}`.
#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub data: Value,
    #[serde(default)]
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Queued,
    Written { updated_at: OffsetDateTime, applied: bool },
}

/// Accept a full-document write.
///
/// # Errors
///
/// A document that is not a JSON object or whose version does not fit, or
/// a failed synchronous write.
pub async fn write_session(
    state: &AppState,
    session_id: &str,
    request: WriteRequest,
    user_id: Option<String>,
) -> Result<WriteResult, SessionError> {
    let document = CanvasState::from_value(&request.data)
        .ok_or_else(|| SessionError::InvalidDocument("data must be a JSON object".into()))?;
    let version = i64::try_from(document.version)
        .map_err(|_| SessionError::InvalidDocument(format!("version {} out of range", document.version)))?;
    let data = serde_json::to_value(&document).map_err(|e| SessionError::InvalidDocument(e.to_string()))?;
    debug!(%session_id, version, reasons = ?request.reasons, "session write received");

    if let Some(tx) = &state.checkpoint_tx {
        let message = CheckpointMessage { session_id: session_id.to_owned(), checkpoint_data: data.clone(), user_id: user_id.clone() };
        if enqueue_checkpoint(tx, message).is_ok() {
            return Ok(WriteResult::Queued);
        }
    }

    let outcome = state.repo.save_session(session_id, &data, version, user_id.as_deref()).await?;
    info!(%session_id, version, applied = outcome.applied, stored_version = outcome.version, "session written");
    Ok(WriteResult::Written { updated_at: outcome.updated_at, applied: outcome.applied })
}

/// The stored document, or `None` for a session never written.
///
/// # Errors
///
/// Database failure.
pub async fn load_session(state: &AppState, session_id: &str) -> Result<Option<Value>, SessionError> {
    let Some(stored) = state.repo.load_session(session_id).await? else {
        return Ok(None);
    };
    let mut data = stored.data;
    if let Some(object) = data.as_object_mut() {
        object.insert("version".into(), Value::from(stored.version));
        object.insert("updatedAt".into(), Value::from(format_timestamp(stored.updated_at)));
    }
    Ok(Some(data))
}

#[must_use]
pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

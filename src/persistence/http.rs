//! HTTP write-through sink for durable sessions.
//!
//! Thin wrapper over the relay server's session routes. Status handling lives
//! in pure `parse_*` functions for testability.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{PersistError, PersistenceSink, WriteAck};
use crate::config::session_endpoint;
use crate::doc::CanvasState;
use crate::store::DirtyReason;

const REQUEST_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// CLIENT
// =============================================================================

pub struct HttpSink {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSink {
    /// # Errors
    ///
    /// Fails if `base_url` is not an absolute http(s) URL or the HTTP client
    /// cannot be built.
    pub fn new(base_url: &str) -> Result<Self, PersistError> {
        if session_endpoint(base_url, "", &[]).is_none() {
            return Err(PersistError::InvalidUrl(base_url.to_owned()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self { http, base_url: base_url.to_owned() })
    }

    fn session_url(&self, session_id: &str, tail: &[&str]) -> Result<reqwest::Url, PersistError> {
        session_endpoint(&self.base_url, session_id, tail).ok_or_else(|| PersistError::InvalidUrl(self.base_url.clone()))
    }

    /// Store a named checkpoint with an optional PNG preview. Not part of the
    /// autosave loop; the server enforces count and size caps.
    ///
    /// # Errors
    ///
    /// Transport failures, or a non-success status such as a cap violation.
    pub async fn export_checkpoint(
        &self,
        session_id: &str,
        name: &str,
        state: &CanvasState,
        preview_png: Option<&[u8]>,
    ) -> Result<CheckpointInfo, PersistError> {
        let body = CheckpointRequest { name, data: state, preview_png: preview_png.map(|bytes| BASE64.encode(bytes)) };
        let response = self
            .http
            .post(self.session_url(session_id, &["snapshots"])?)
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        parse_checkpoint_response(status, &text)
    }

    /// List stored checkpoints, newest first.
    ///
    /// # Errors
    ///
    /// Transport failures or a non-success status.
    pub async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointInfo>, PersistError> {
        let response = self.http.get(self.session_url(session_id, &["snapshots"])?).send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        if status != 200 {
            return Err(PersistError::Status { status, body: text });
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl PersistenceSink for HttpSink {
    async fn write(&self, session_id: &str, state: &CanvasState, reasons: &[DirtyReason]) -> Result<WriteAck, PersistError> {
        let response = self
            .http
            .put(self.session_url(session_id, &[])?)
            .json(&WriteRequest { data: state, reasons })
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        parse_write_response(status, &text)
    }

    async fn load(&self, session_id: &str) -> Result<Option<CanvasState>, PersistError> {
        let response = self.http.get(self.session_url(session_id, &[])?).send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        parse_load_response(status, &text)
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Serialize)]
struct WriteRequest<'a> {
    data: &'a CanvasState,
    reasons: &'a [DirtyReason],
}

#[derive(Deserialize, Default)]
struct WriteResponse {
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Serialize)]
struct CheckpointRequest<'a> {
    name: &'a str,
    data: &'a CanvasState,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview_png: Option<String>,
}

/// A stored checkpoint as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub id: uuid::Uuid,
    pub name: String,
    pub created_at: String,
    #[serde(default)]
    pub has_preview: bool,
}

// =============================================================================
// PARSING
// =============================================================================

/// 202 means queued, 200 means written with the server's canonical
/// timestamp. Anything else is a failure.
pub(crate) fn parse_write_response(status: u16, body: &str) -> Result<WriteAck, PersistError> {
    match status {
        202 => Ok(WriteAck::Queued),
        200 => {
            let parsed: WriteResponse = serde_json::from_str(body).unwrap_or_default();
            Ok(WriteAck::Persisted { updated_at: parsed.updated_at })
        }
        _ => Err(PersistError::Status { status, body: body.to_owned() }),
    }
}

/// 200 with a JSON document (or `null`), 404 for an unknown session.
pub(crate) fn parse_load_response(status: u16, body: &str) -> Result<Option<CanvasState>, PersistError> {
    match status {
        404 => Ok(None),
        200 => {
            let value: Value = serde_json::from_str(body)?;
            Ok(CanvasState::from_value(&value))
        }
        _ => Err(PersistError::Status { status, body: body.to_owned() }),
    }
}

pub(crate) fn parse_checkpoint_response(status: u16, body: &str) -> Result<CheckpointInfo, PersistError> {
    if status != 200 && status != 201 {
        return Err(PersistError::Status { status, body: body.to_owned() });
    }
    Ok(serde_json::from_str(body)?)
}

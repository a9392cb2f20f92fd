//! Local-only storage for ephemeral sessions.
//!
//! Entries are the exact serialized document, keyed by session id under a
//! fixed namespace. `LocalSink` adapts any `LocalStorage` to the sink
//! interface, so the coordinator treats demo sessions like any other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::{PersistError, PersistenceSink, WriteAck};
use crate::doc::CanvasState;
use crate::store::DirtyReason;

const NAMESPACE: &str = "sessionboard.canvas.";

fn storage_key(session_id: &str) -> String {
    format!("{NAMESPACE}{session_id}")
}

fn decode(text: &str) -> Option<CanvasState> {
    serde_json::from_str::<Value>(text).ok().as_ref().and_then(CanvasState::from_value)
}

#[async_trait]
pub trait LocalStorage: Send + Sync {
    /// # Errors
    ///
    /// Encoding or storage I/O failures.
    async fn save_local(&self, session_id: &str, state: &CanvasState) -> Result<(), PersistError>;

    /// `None` when nothing is stored or the entry is unreadable.
    ///
    /// # Errors
    ///
    /// Storage I/O failures other than a missing entry.
    async fn load_local(&self, session_id: &str) -> Result<Option<CanvasState>, PersistError>;
}

// =============================================================================
// MEMORY
// =============================================================================

/// Process-lifetime storage. Clones share entries.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored text, for inspection.
    pub async fn raw(&self, session_id: &str) -> Option<String> {
        self.entries.read().await.get(&storage_key(session_id)).cloned()
    }
}

#[async_trait]
impl LocalStorage for MemoryStorage {
    async fn save_local(&self, session_id: &str, state: &CanvasState) -> Result<(), PersistError> {
        let text = serde_json::to_string(state)?;
        self.entries.write().await.insert(storage_key(session_id), text);
        Ok(())
    }

    async fn load_local(&self, session_id: &str) -> Result<Option<CanvasState>, PersistError> {
        Ok(self.entries.read().await.get(&storage_key(session_id)).and_then(|text| decode(text)))
    }
}

// =============================================================================
// FILE
// =============================================================================

/// One JSON file per session in a directory. Writes go to a temporary file
/// first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        let name: String = storage_key(session_id)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl LocalStorage for FileStorage {
    async fn save_local(&self, session_id: &str, state: &CanvasState) -> Result<(), PersistError> {
        let text = serde_json::to_vec(state)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(session_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &text).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), bytes = text.len(), "local canvas saved");
        Ok(())
    }

    async fn load_local(&self, session_id: &str) -> Result<Option<CanvasState>, PersistError> {
        match tokio::fs::read_to_string(self.path_for(session_id)).await {
            Ok(text) => Ok(decode(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// SINK
// =============================================================================

/// Sink for ephemeral sessions. Writes are durable as soon as local storage
/// accepts them; no timestamp comes back, so the coordinator uses its own.
pub struct LocalSink {
    storage: Arc<dyn LocalStorage>,
}

impl LocalSink {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl PersistenceSink for LocalSink {
    async fn write(&self, session_id: &str, state: &CanvasState, reasons: &[DirtyReason]) -> Result<WriteAck, PersistError> {
        self.storage.save_local(session_id, state).await?;
        debug!(%session_id, version = state.version, reasons = reasons.len(), "ephemeral session saved locally");
        Ok(WriteAck::Persisted { updated_at: None })
    }

    async fn load(&self, session_id: &str) -> Result<Option<CanvasState>, PersistError> {
        self.storage.load_local(session_id).await
    }
}

//! Durable persistence: sinks, local storage, and the flush coordinator.
//!
//! DESIGN
//! ======
//! The coordinator talks to exactly one `PersistenceSink` per session and
//! never knows which kind it holds. Durable sessions write through HTTP to
//! the relay server; ephemeral (demo) sessions, recognized by an id prefix,
//! write to local storage instead. Version and timestamp bookkeeping is the
//! same either way.
//!
//! ERROR HANDLING
//! ==============
//! A failed write never drops intent: the coordinator puts the flushed
//! reasons back into the store's dirty set and the next autosave tick tries
//! again. Errors are returned to the caller and reported through the
//! optional error hook. They are never fatal to the session.

mod coordinator;
mod http;
mod local;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use async_trait::async_trait;

use crate::doc::CanvasState;
use crate::event::ErrorCode;
use crate::store::DirtyReason;

pub use coordinator::{Autosave, AutosaveHandle, ErrorHook, FlushOutcome, PersistenceCoordinator, SaveStatus};
pub use http::{CheckpointInfo, HttpSink};
pub use local::{FileStorage, LocalSink, LocalStorage, MemoryStorage};

pub const DEFAULT_DEMO_PREFIX: &str = "demo-";
pub const DEFAULT_AUTOSAVE_INTERVAL_MS: u64 = 5000;

// =============================================================================
// TYPES
// =============================================================================

/// How a sink accepted a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAck {
    /// Accepted for asynchronous processing. Not yet durable.
    Queued,
    /// Durable now. Carries the canonical timestamp when the sink has one.
    Persisted { updated_at: Option<String> },
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("local storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("document encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
    #[error("invalid base url: {0}")]
    InvalidUrl(String),
}

impl ErrorCode for PersistError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Http(_) => "E_PERSIST_HTTP",
            Self::Status { .. } => "E_PERSIST_STATUS",
            Self::Storage(_) => "E_PERSIST_STORAGE",
            Self::Encode(_) => "E_PERSIST_ENCODE",
            Self::Unavailable(_) => "E_PERSIST_UNAVAILABLE",
            Self::InvalidUrl(_) => "E_PERSIST_URL",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Unavailable(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Storage(_) | Self::Encode(_) | Self::InvalidUrl(_) => false,
        }
    }
}

// =============================================================================
// SINK
// =============================================================================

/// Where a session's document goes when flushed and comes from when opened.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Write the full document. `reasons` explain the flush and are
    /// informational only.
    ///
    /// # Errors
    ///
    /// Any failure to get the write accepted.
    async fn write(&self, session_id: &str, state: &CanvasState, reasons: &[DirtyReason]) -> Result<WriteAck, PersistError>;

    /// Load the stored document, `None` when the session has none yet.
    ///
    /// # Errors
    ///
    /// Transport or storage failures. A malformed stored document is not an
    /// error; it loads leniently.
    async fn load(&self, session_id: &str) -> Result<Option<CanvasState>, PersistError>;
}

/// Ephemeral sessions are recognized by their id prefix.
#[must_use]
pub fn is_ephemeral_session(session_id: &str, demo_prefix: &str) -> bool {
    !demo_prefix.is_empty() && session_id.starts_with(demo_prefix)
}

/// Pick the sink for a session: local storage for ephemeral ids, the durable
/// write-through otherwise.
pub fn sink_for_session(
    session_id: &str,
    demo_prefix: &str,
    durable: Arc<dyn PersistenceSink>,
    local: Arc<dyn PersistenceSink>,
) -> Arc<dyn PersistenceSink> {
    if is_ephemeral_session(session_id, demo_prefix) { local } else { durable }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::mock::RecordingSink;

    #[test]
    fn demo_prefix_selects_ephemeral() {
        assert!(is_ephemeral_session("demo-abc123", DEFAULT_DEMO_PREFIX));
        assert!(!is_ephemeral_session("abc123", DEFAULT_DEMO_PREFIX));
        assert!(!is_ephemeral_session("my-demo-1", DEFAULT_DEMO_PREFIX));
        assert!(!is_ephemeral_session("demo-abc123", ""));
    }

    #[test]
    fn sink_for_session_routes_by_prefix() {
        let durable: Arc<dyn PersistenceSink> = Arc::new(RecordingSink::queued());
        let local: Arc<dyn PersistenceSink> = Arc::new(RecordingSink::persisted(None));
        let picked = sink_for_session("demo-abc123", "demo-", Arc::clone(&durable), Arc::clone(&local));
        assert!(Arc::ptr_eq(&picked, &local));
        let picked = sink_for_session("s-1", "demo-", Arc::clone(&durable), local);
        assert!(Arc::ptr_eq(&picked, &durable));
    }

    #[test]
    fn status_retryability() {
        assert!(PersistError::Status { status: 503, body: String::new() }.retryable());
        assert!(PersistError::Status { status: 429, body: String::new() }.retryable());
        assert!(!PersistError::Status { status: 400, body: String::new() }.retryable());
        assert_eq!(PersistError::Unavailable("down".into()).error_code(), "E_PERSIST_UNAVAILABLE");
    }
}

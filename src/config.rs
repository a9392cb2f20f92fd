//! Client configuration from the environment.
//!
//! Every knob has a default; a missing or unparsable variable falls back to
//! it rather than failing startup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{Backoff, DEFAULT_CHANNEL_CAPACITY, DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_MAX_MS};
use crate::history::DEFAULT_HISTORY_LIMIT;
use crate::persistence::{
    DEFAULT_AUTOSAVE_INTERVAL_MS, DEFAULT_DEMO_PREFIX, FileStorage, HttpSink, LocalSink, LocalStorage, MemoryStorage,
    PersistError, PersistenceSink, sink_for_session,
};

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:3000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub autosave_interval_ms: u64,
    pub history_limit: usize,
    pub api_base_url: String,
    pub ws_base_url: String,
    /// Directory for ephemeral-session files. In-memory storage when unset.
    pub local_storage_dir: Option<PathBuf>,
    pub demo_prefix: String,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            autosave_interval_ms: DEFAULT_AUTOSAVE_INTERVAL_MS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            api_base_url: DEFAULT_API_BASE_URL.to_owned(),
            ws_base_url: ws_base_from_api(DEFAULT_API_BASE_URL),
            local_storage_dir: None,
            demo_prefix: DEFAULT_DEMO_PREFIX.to_owned(),
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. `from_env` uses the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let api_base_url = lookup("SYNC_API_BASE_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_owned());
        let ws_base_url = lookup("SYNC_WS_BASE_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| ws_base_from_api(&api_base_url));
        Self {
            autosave_interval_ms: env_parse(&lookup, "SYNC_AUTOSAVE_INTERVAL_MS", DEFAULT_AUTOSAVE_INTERVAL_MS).max(1),
            history_limit: env_parse(&lookup, "SYNC_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT),
            api_base_url,
            ws_base_url,
            local_storage_dir: lookup("SYNC_LOCAL_STORAGE_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            demo_prefix: lookup("SYNC_DEMO_PREFIX").unwrap_or_else(|| DEFAULT_DEMO_PREFIX.to_owned()),
            reconnect_base_ms: env_parse(&lookup, "SYNC_RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS),
            reconnect_max_ms: env_parse(&lookup, "SYNC_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS),
            channel_capacity: env_parse(&lookup, "SYNC_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY),
        }
    }

    #[must_use]
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_interval_ms)
    }

    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(Duration::from_millis(self.reconnect_base_ms), Duration::from_millis(self.reconnect_max_ms))
    }

    /// Local storage for ephemeral sessions. Each call builds a new store;
    /// share one through [`SyncConfig::sinks`].
    #[must_use]
    pub fn local_storage(&self) -> Arc<dyn LocalStorage> {
        match &self.local_storage_dir {
            Some(dir) => Arc::new(FileStorage::new(dir.clone())),
            None => Arc::new(MemoryStorage::new()),
        }
    }

    /// Build the durable and local sinks once, for every session this process
    /// opens.
    ///
    /// # Errors
    ///
    /// Fails if the API base URL is invalid or the HTTP client cannot be
    /// built.
    pub fn sinks(&self) -> Result<SessionSinks, PersistError> {
        Ok(SessionSinks {
            durable: Arc::new(HttpSink::new(&self.api_base_url)?),
            local: Arc::new(LocalSink::new(self.local_storage())),
            demo_prefix: self.demo_prefix.clone(),
        })
    }
}

/// Sinks shared across sessions. Demo sessions opened through the same
/// `SessionSinks` see each other's local saves.
#[derive(Clone)]
pub struct SessionSinks {
    durable: Arc<dyn PersistenceSink>,
    local: Arc<dyn PersistenceSink>,
    demo_prefix: String,
}

impl SessionSinks {
    /// The sink a session should persist through.
    #[must_use]
    pub fn for_session(&self, session_id: &str) -> Arc<dyn PersistenceSink> {
        sink_for_session(session_id, &self.demo_prefix, Arc::clone(&self.durable), Arc::clone(&self.local))
    }
}

fn env_parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|v| v.trim().parse::<T>().ok()).unwrap_or(default)
}

/// `{base}/sessions/{session_id}/{tail..}` with each segment percent-encoded,
/// so ids containing `/`, `?` or `#` stay one path segment. `None` when the
/// base cannot carry a path.
pub(crate) fn session_endpoint(base: &str, session_id: &str, tail: &[&str]) -> Option<reqwest::Url> {
    let mut url = reqwest::Url::parse(base).ok()?;
    url.set_fragment(None);
    url.path_segments_mut().ok()?.pop_if_empty().push("sessions").push(session_id).extend(tail);
    Some(url)
}

/// `http://host` -> `ws://host`, `https://host` -> `wss://host`.
fn ws_base_from_api(api: &str) -> String {
    let api = api.trim_end_matches('/');
    if let Some(rest) = api.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api.to_owned()
    }
}

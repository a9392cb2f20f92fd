//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the session repository, the live relay rooms, the optional
//! checkpoint queue, and snapshot caps. The relay keeps no document state:
//! a room is only the set of connected sockets for one session.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::db::Repository;
use crate::services::checkpoint::CheckpointLimits;
use crate::services::persistence::CheckpointMessage;

// =============================================================================
// SESSION ROOM
// =============================================================================

/// Connected sockets for one session: connection id -> outgoing text frames.
pub struct SessionRoom {
    pub clients: HashMap<Uuid, mpsc::Sender<String>>,
}

impl SessionRoom {
    #[must_use]
    pub fn new() -> Self {
        Self { clients: HashMap::new() }
    }
}

impl Default for SessionRoom {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Clone is required by Axum; all inner fields are Arc-wrapped or Clone.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub rooms: Arc<RwLock<HashMap<String, SessionRoom>>>,
    /// Asynchronous checkpoint queue. `None` means every write is synchronous.
    pub checkpoint_tx: Option<mpsc::Sender<CheckpointMessage>>,
    pub limits: CheckpointLimits,
}

impl AppState {
    #[must_use]
    pub fn new(repo: Arc<dyn Repository>, limits: CheckpointLimits) -> Self {
        Self { repo, rooms: Arc::new(RwLock::new(HashMap::new())), checkpoint_tx: None, limits }
    }

    #[must_use]
    pub fn with_checkpoint_queue(mut self, tx: mpsc::Sender<CheckpointMessage>) -> Self {
        self.checkpoint_tx = Some(tx);
        self
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
#[path = "state_helpers_test.rs"]
pub mod test_helpers;

#[cfg(test)]
#[path = "state_test.rs"]
mod state_test;

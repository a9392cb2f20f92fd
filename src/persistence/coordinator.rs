//! Persistence coordinator: turns dirty reasons into durable writes.
//!
//! DESIGN
//! ======
//! Per-session state machine, published on a watch channel:
//!
//! ```text
//! Idle --mutation--> Dirty --flush--> Flushing --ok--> Idle
//!                      ^                  |
//!                      +------error-------+   (reasons re-queued)
//! ```
//!
//! A flush always writes the whole document at `last_saved_version + 1`.
//! A `Queued` acknowledgment advances the watermark immediately, before the
//! server has processed the write. Peers reject events tagged below the
//! watermark, so this keeps staleness checks moving during an eventual-
//! consistency window in which the stored version may lag the local one.
//!
//! Flushes are serialized per coordinator so two writes never claim the same
//! version.
//!
//! ERROR HANDLING
//! ==============
//! On any write failure the flushed reasons go back into the store's dirty
//! set before the error is returned, and the error hook fires. After
//! `close()`, results of writes still in flight are discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{PersistError, PersistenceSink, WriteAck};
use crate::event::{ErrorCode, now_iso};
use crate::store::{DirtyReason, DirtyReasons, SharedStore};

/// Save indicator for "changes pending sync" UIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Idle,
    Dirty,
    Flushing,
}

/// What a flush call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing pending and not forced.
    Skipped,
    /// Accepted for asynchronous persistence at `version`.
    Queued { version: u64 },
    /// Durably written at `version`.
    Persisted { version: u64, updated_at: String },
    /// The coordinator was closed while the write was in flight.
    Discarded,
}

pub type ErrorHook = Arc<dyn Fn(&PersistError) + Send + Sync>;

pub struct PersistenceCoordinator {
    session_id: String,
    store: SharedStore,
    sink: Arc<dyn PersistenceSink>,
    status: watch::Sender<SaveStatus>,
    on_error: Option<ErrorHook>,
    closed: AtomicBool,
    flushing: Mutex<()>,
}

impl PersistenceCoordinator {
    pub fn new(session_id: impl Into<String>, store: SharedStore, sink: Arc<dyn PersistenceSink>) -> Self {
        let (status, _) = watch::channel(SaveStatus::Idle);
        Self {
            session_id: session_id.into(),
            store,
            sink,
            status,
            on_error: None,
            closed: AtomicBool::new(false),
            flushing: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        self.on_error = Some(hook);
        self
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<dyn PersistenceSink> {
        &self.sink
    }

    #[must_use]
    pub fn status(&self) -> SaveStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SaveStatus> {
        self.status.subscribe()
    }

    /// Re-derive Idle/Dirty from the store. Call after local mutations.
    pub async fn refresh_status(&self) {
        if self.status() == SaveStatus::Flushing {
            return;
        }
        let dirty = self.store.read().await.is_dirty();
        self.set_status(if dirty { SaveStatus::Dirty } else { SaveStatus::Idle });
    }

    fn set_status(&self, status: SaveStatus) {
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    /// Stop accepting results. Writes already in flight finish but their
    /// outcome is ignored.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// One autosave step: take pending reasons and flush if there are any.
    ///
    /// # Errors
    ///
    /// The write failure, after the reasons were re-queued.
    pub async fn autosave_tick(&self) -> Result<FlushOutcome, PersistError> {
        if self.is_closed() {
            return Ok(FlushOutcome::Skipped);
        }
        let reasons = self.store.write().await.consume_dirty_reasons();
        if reasons.is_empty() {
            return Ok(FlushOutcome::Skipped);
        }
        self.flush(reasons, false).await
    }

    /// Write the full document. A no-op when `reasons` is empty unless
    /// `force` is set.
    ///
    /// # Errors
    ///
    /// The write failure. `reasons` are back in the store's dirty set by the
    /// time this returns.
    pub async fn flush(&self, reasons: DirtyReasons, force: bool) -> Result<FlushOutcome, PersistError> {
        if reasons.is_empty() && !force {
            return Ok(FlushOutcome::Skipped);
        }
        let _serial = self.flushing.lock().await;

        // PHASE: SNAPSHOT UNDER THE LOCK
        // WHY: the write is slow; the store must stay editable during it.
        let (state, version, updated_at) = {
            let store = self.store.read().await;
            let version = store.last_saved_version() + 1;
            let updated_at = now_iso();
            let mut state = store.snapshot();
            state.version = version;
            state.updated_at = Some(updated_at.clone());
            (state, version, updated_at)
        };
        self.set_status(SaveStatus::Flushing);

        // PHASE: WRITE WITHOUT THE LOCK
        let reason_list: Vec<DirtyReason> = reasons.iter().copied().collect();
        let result = self.sink.write(&self.session_id, &state, &reason_list).await;

        if self.is_closed() {
            debug!(session_id = %self.session_id, version, "coordinator closed; write result discarded");
            return Ok(FlushOutcome::Discarded);
        }

        // PHASE: RECORD THE OUTCOME
        let outcome = match result {
            Ok(WriteAck::Queued) => {
                self.store.write().await.set_last_persisted_version(version, Some(updated_at));
                info!(session_id = %self.session_id, version, reasons = reason_list.len(), "flush queued");
                FlushOutcome::Queued { version }
            }
            Ok(WriteAck::Persisted { updated_at: confirmed }) => {
                let updated_at = confirmed.unwrap_or(updated_at);
                self.store.write().await.set_last_persisted_version(version, Some(updated_at.clone()));
                info!(session_id = %self.session_id, version, reasons = reason_list.len(), "flush persisted");
                FlushOutcome::Persisted { version, updated_at }
            }
            Err(e) => {
                self.store.write().await.requeue_dirty_reasons(reasons);
                self.set_status(SaveStatus::Dirty);
                warn!(
                    session_id = %self.session_id,
                    version,
                    code = e.error_code(),
                    retryable = e.retryable(),
                    error = %e,
                    "flush failed; reasons re-queued"
                );
                if let Some(hook) = &self.on_error {
                    hook(&e);
                }
                return Err(e);
            }
        };

        let dirty = self.store.read().await.is_dirty();
        self.set_status(if dirty { SaveStatus::Dirty } else { SaveStatus::Idle });
        Ok(outcome)
    }
}

// =============================================================================
// AUTOSAVE
// =============================================================================

/// Fixed-interval autosave driver.
pub struct Autosave;

impl Autosave {
    /// Tick every `interval`, starting one interval from now. Missed ticks
    /// are skipped, not bunched.
    pub fn start(coordinator: Arc<PersistenceCoordinator>, interval: Duration) -> AutosaveHandle {
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        // Failures are already logged and reported by the coordinator.
                        let _ = coordinator.autosave_tick().await;
                    }
                }
            }
            debug!(session_id = %coordinator.session_id(), "autosave stopped");
        });
        AutosaveHandle { shutdown: Some(shutdown), task: Some(task) }
    }
}

/// Disposer for a running autosave loop. Dropping it also stops the loop.
pub struct AutosaveHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AutosaveHandle {
    /// Stop ticking and wait for an in-progress tick to finish.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AutosaveHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[cfg(test)]
#[path = "coordinator_test.rs"]
mod coordinator_test;

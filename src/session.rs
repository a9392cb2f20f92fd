//! Sync session: one client's live connection to one shared canvas.
//!
//! ARCHITECTURE
//! ============
//! ```text
//!   UI ──mutate()──▶ MutationStore ──outbound──▶ Channel ──▶ peers
//!                        ▲    │
//!        Reconciler ─────┘    └──dirty reasons──▶ PersistenceCoordinator ──▶ sink
//!            ▲
//!   Channel signals (events + status)
//! ```
//!
//! The session owns the wiring and nothing else: the store holds state, the
//! reconciler decides what an inbound event means, the coordinator persists.
//!
//! DESIGN
//! ======
//! - Local changes are published after the store lock is released, tagged
//!   with the watermark the change was made against.
//! - Reaching `Subscribed` (first connect or any reconnect) publishes a
//!   `state.request` carrying our watermark, since nothing missed while
//!   disconnected will ever be replayed.
//! - `pump()` drains pending signals synchronously, so tests can step
//!   several sessions deterministically. `start()` runs the same handling in
//!   a background task plus the autosave driver and returns a disposer.
//!
//! ERROR HANDLING
//! ==============
//! Publish failures are logged and dropped: the document stays authoritative
//! locally and peers catch up through persistence or resync.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelError, ChannelSignal, ChannelStatus};
use crate::doc;
use crate::event::{ClientId, EventBody, StateRequestPayload, SyncEvent};
use crate::persistence::{
    Autosave, AutosaveHandle, ErrorHook, FlushOutcome, PersistError, PersistenceCoordinator, PersistenceSink,
};
use crate::reconcile::{Outcome, Reconciler};
use crate::store::{MutationStore, SharedStore};

/// Construction knobs for a session.
#[derive(Clone)]
pub struct SessionOptions {
    pub history_limit: usize,
    pub autosave_interval: Duration,
    pub on_error: Option<ErrorHook>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            history_limit: crate::history::DEFAULT_HISTORY_LIMIT,
            autosave_interval: Duration::from_millis(crate::persistence::DEFAULT_AUTOSAVE_INTERVAL_MS),
            on_error: None,
        }
    }
}

impl From<&crate::config::SyncConfig> for SessionOptions {
    fn from(config: &crate::config::SyncConfig) -> Self {
        Self {
            history_limit: config.history_limit,
            autosave_interval: config.autosave_interval(),
            on_error: None,
        }
    }
}

pub struct SyncSession {
    session_id: String,
    client_id: ClientId,
    store: SharedStore,
    channel: Arc<dyn Channel>,
    reconciler: Reconciler,
    coordinator: Arc<PersistenceCoordinator>,
    signals: Mutex<Option<mpsc::Receiver<ChannelSignal>>>,
    autosave_interval: Duration,
}

impl SyncSession {
    /// Load the stored document through `sink` and build a session around
    /// it. A session with nothing stored starts empty at version 0.
    ///
    /// # Errors
    ///
    /// Fails if the sink cannot be read. Starting empty instead would let the
    /// first autosave overwrite the stored document.
    pub async fn open(
        session_id: impl Into<String>,
        client_id: ClientId,
        channel: Arc<dyn Channel>,
        sink: Arc<dyn PersistenceSink>,
        options: SessionOptions,
    ) -> Result<Self, PersistError> {
        let session_id = session_id.into();
        let stored = sink.load(&session_id).await?;
        let canvas = doc::deserialize(stored.as_ref());
        info!(
            %session_id,
            %client_id,
            version = canvas.version.unwrap_or(0),
            entities = canvas.elements.len(),
            "session opened"
        );
        let store = MutationStore::from_canvas(client_id, canvas, options.history_limit);
        Ok(Self::with_store(session_id, store, channel, sink, options))
    }

    /// Build a session around an existing store without loading.
    pub fn with_store(
        session_id: impl Into<String>,
        store: MutationStore,
        channel: Arc<dyn Channel>,
        sink: Arc<dyn PersistenceSink>,
        options: SessionOptions,
    ) -> Self {
        let session_id = session_id.into();
        let client_id = store.client_id();
        let store = store.into_shared();
        let mut coordinator = PersistenceCoordinator::new(session_id.clone(), Arc::clone(&store), sink);
        if let Some(hook) = options.on_error {
            coordinator = coordinator.with_error_hook(hook);
        }
        Self {
            reconciler: Reconciler::new(session_id.clone(), client_id),
            session_id,
            client_id,
            store,
            channel,
            coordinator: Arc::new(coordinator),
            signals: Mutex::new(None),
            autosave_interval: options.autosave_interval,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    #[must_use]
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<PersistenceCoordinator> {
        &self.coordinator
    }

    // -------------------------------------------------------------------------
    // Local changes
    // -------------------------------------------------------------------------

    /// Run a local change against the store, then broadcast whatever it
    /// queued.
    pub async fn mutate<R>(&self, change: impl FnOnce(&mut MutationStore) -> R) -> R {
        let (result, outbound, version) = {
            let mut store = self.store.write().await;
            let result = change(&mut store);
            (result, store.drain_outbound(), store.last_saved_version())
        };
        for body in outbound {
            self.publish(body, Some(version)).await;
        }
        self.coordinator.refresh_status().await;
        result
    }

    async fn publish(&self, body: EventBody, version: Option<u64>) {
        let mut event = SyncEvent::new(self.session_id.clone(), self.client_id, body);
        event.version = version;
        self.publish_event(&event).await;
    }

    async fn publish_event(&self, event: &SyncEvent) {
        if let Err(e) = self.channel.publish(event).await {
            warn!(session_id = %self.session_id, event_type = %event.event_type(), error = %e, "publish failed");
        }
    }

    /// Ask peers for anything newer than our watermark.
    pub async fn request_state(&self) {
        let since = self.store.read().await.last_saved_version();
        debug!(session_id = %self.session_id, since, "requesting state");
        self.publish(EventBody::StateRequest(StateRequestPayload { since_version: Some(since) }), None)
            .await;
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Subscribe to the channel. Signals are then handled by `pump()` or by
    /// the task `start()` spawns.
    ///
    /// # Errors
    ///
    /// Fails if the channel cannot subscribe.
    pub async fn subscribe(&self) -> Result<(), ChannelError> {
        let rx = self.channel.subscribe().await?;
        *self.signals.lock().await = Some(rx);
        Ok(())
    }

    /// React to one channel signal. Returns the reconcile outcome for events.
    pub async fn handle_signal(&self, signal: ChannelSignal) -> Option<Outcome> {
        match signal {
            ChannelSignal::Event(event) => Some(self.handle_event(&event).await),
            ChannelSignal::Status(status) => {
                self.handle_status(status).await;
                None
            }
        }
    }

    async fn handle_event(&self, event: &SyncEvent) -> Outcome {
        let outcome = {
            let mut store = self.store.write().await;
            self.reconciler.handle(&mut store, event)
        };
        match &outcome {
            Outcome::Respond(reply) => self.publish_event(reply).await,
            Outcome::Applied => self.coordinator.refresh_status().await,
            _ => {}
        }
        outcome
    }

    async fn handle_status(&self, status: ChannelStatus) {
        match status {
            ChannelStatus::Subscribed => {
                info!(session_id = %self.session_id, client_id = %self.client_id, "channel subscribed");
                self.request_state().await;
            }
            ChannelStatus::Connecting => debug!(session_id = %self.session_id, "channel connecting"),
            ChannelStatus::Closed => info!(session_id = %self.session_id, "channel closed"),
            ChannelStatus::Errored(reason) => warn!(session_id = %self.session_id, %reason, "channel errored"),
        }
    }

    /// Handle every signal already waiting. Returns how many were handled.
    pub async fn pump(&self) -> usize {
        let mut handled = 0;
        loop {
            let next = {
                let mut guard = self.signals.lock().await;
                let Some(rx) = guard.as_mut() else {
                    return handled;
                };
                rx.try_recv().ok()
            };
            let Some(signal) = next else {
                return handled;
            };
            self.handle_signal(signal).await;
            handled += 1;
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Subscribe if needed, then handle signals and autosave in the
    /// background until the returned handle is stopped.
    ///
    /// # Errors
    ///
    /// Fails if the channel cannot subscribe.
    pub async fn start(self: &Arc<Self>) -> Result<SessionHandle, ChannelError> {
        let existing = self.signals.lock().await.take();
        let mut rx = match existing {
            Some(rx) => rx,
            None => self.channel.subscribe().await?,
        };

        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    signal = rx.recv() => match signal {
                        Some(signal) => {
                            session.handle_signal(signal).await;
                        }
                        None => break,
                    },
                }
            }
            debug!(session_id = %session.session_id, "session loop stopped");
        });
        let autosave = Autosave::start(Arc::clone(&self.coordinator), self.autosave_interval);
        Ok(SessionHandle { session: Arc::clone(self), shutdown: Some(shutdown), task: Some(task), autosave: Some(autosave) })
    }

    /// Final checkpoint then teardown: flush everything pending (even if
    /// nothing is), leave the channel, and stop accepting write results.
    ///
    /// # Errors
    ///
    /// The final flush failure. Teardown happens regardless.
    pub async fn close(&self) -> Result<FlushOutcome, PersistError> {
        let reasons = self.store.write().await.consume_dirty_reasons();
        let result = self.coordinator.flush(reasons, true).await;
        if let Err(e) = &result {
            error!(session_id = %self.session_id, error = %e, "final flush failed");
        }
        self.teardown().await;
        result
    }

    async fn teardown(&self) {
        self.channel.unsubscribe().await;
        self.coordinator.close();
        self.signals.lock().await.take();
        info!(session_id = %self.session_id, client_id = %self.client_id, "session closed");
    }
}

/// Disposer for a started session.
pub struct SessionHandle {
    session: Arc<SyncSession>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    autosave: Option<AutosaveHandle>,
}

impl SessionHandle {
    #[must_use]
    pub fn session(&self) -> &Arc<SyncSession> {
        &self.session
    }

    async fn halt(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(autosave) = self.autosave.take() {
            autosave.stop().await;
        }
    }

    /// Unsubscribe, stop autosave, and discard results of writes still in
    /// flight. Pending changes are not flushed.
    pub async fn stop(mut self) {
        self.halt().await;
        self.session.teardown().await;
    }

    /// Stop background work, then flush a final checkpoint and tear down.
    ///
    /// # Errors
    ///
    /// The final flush failure.
    pub async fn close(mut self) -> Result<FlushOutcome, PersistError> {
        self.halt().await;
        self.session.close().await
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;

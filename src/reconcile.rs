//! Reconciliation of inbound channel events against the local store.
//!
//! DESIGN
//! ======
//! Checks run in a fixed order, cheapest first:
//! 1. Self-echo: events carrying our own `ClientId` are dropped.
//! 2. Session: events for another session are dropped.
//! 3. Staleness: a mutation or snapshot tagged with a version below the
//!    store's persisted watermark describes a state we already superseded
//!    through a confirmed write. Applying it would resurrect overwritten data,
//!    so it is dropped. Untagged events are never stale.
//!
//! Accepted entity events are applied inside the store's remote-apply guard
//! with history skipped, so they neither re-broadcast nor become undoable.
//! The guard is scoped; the flag is restored even if application unwinds.
//!
//! A `state.request` is answered only when our watermark is strictly newer
//! than the requester's floor. Several peers may answer the same request;
//! applying the same snapshot twice is harmless.
//!
//! The handler never does I/O. A reply is returned as `Outcome::Respond` and
//! the caller publishes it.

use tracing::debug;

use crate::event::{ClientId, EventBody, SnapshotOrigin, SnapshotPayload, StateRequestPayload, SyncEvent};
use crate::store::{MutationOptions, MutationStore};

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The event changed the local document.
    Applied,
    /// Our own event, echoed back by the transport.
    SelfEcho,
    /// Addressed to a different session.
    ForeignSession,
    /// Tagged with a version older than our persisted watermark.
    Stale { version: u64, watermark: u64 },
    /// A patch or remove for an entity we do not have.
    MissingTarget,
    /// A state request we can serve. Publish the enclosed snapshot.
    Respond(SyncEvent),
    /// A state request we cannot improve on.
    NotNewer,
}

pub struct Reconciler {
    session_id: String,
    client_id: ClientId,
}

impl Reconciler {
    pub fn new(session_id: impl Into<String>, client_id: ClientId) -> Self {
        Self { session_id: session_id.into(), client_id }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Fold one inbound event into `store`.
    pub fn handle(&self, store: &mut MutationStore, event: &SyncEvent) -> Outcome {
        if event.client_id == self.client_id {
            debug!(event_type = %event.event_type(), "self echo ignored");
            return Outcome::SelfEcho;
        }
        if event.session_id != self.session_id {
            debug!(session_id = %event.session_id, expected = %self.session_id, "foreign session event ignored");
            return Outcome::ForeignSession;
        }

        if let EventBody::StateRequest(request) = &event.body {
            return self.answer_request(store, request);
        }

        let watermark = store.last_saved_version();
        if let Some(version) = event.version.filter(|v| *v < watermark) {
            debug!(event_type = %event.event_type(), version, watermark, "stale event discarded");
            return Outcome::Stale { version, watermark };
        }

        if let EventBody::StateSnapshot(snapshot) = &event.body {
            apply_snapshot(store, snapshot, event.version);
            return Outcome::Applied;
        }

        if apply_entity(store, &event.body) { Outcome::Applied } else { Outcome::MissingTarget }
    }

    fn answer_request(&self, store: &MutationStore, request: &StateRequestPayload) -> Outcome {
        let since = request.since_version.unwrap_or(0);
        let ours = store.last_saved_version();
        if since >= ours {
            debug!(since, ours, "state request not served; local copy is not newer");
            return Outcome::NotNewer;
        }
        let reply = SyncEvent::new(
            self.session_id.clone(),
            self.client_id,
            EventBody::StateSnapshot(SnapshotPayload { state: store.snapshot(), origin: SnapshotOrigin::Resync }),
        )
        .with_version(ours);
        Outcome::Respond(reply)
    }
}

fn apply_snapshot(store: &mut MutationStore, snapshot: &SnapshotPayload, version: Option<u64>) {
    let replace_history = snapshot.origin == SnapshotOrigin::Resync;
    let mut store = store.applying_remote();
    store.apply_snapshot(&snapshot.state, replace_history);
    if let Some(version) = version {
        store.set_last_persisted_version(version, snapshot.state.updated_at.clone());
    }
}

/// Apply an entity mutation. Returns `false` when the target is missing.
fn apply_entity(store: &mut MutationStore, body: &EventBody) -> bool {
    let options = MutationOptions::remote();
    let mut store = store.applying_remote();
    match body {
        EventBody::CardAdd(card) => {
            store.add_card(card.clone(), options);
            true
        }
        EventBody::CardPatch(patch) => store.update_card(patch.clone(), options),
        EventBody::CardRemove(remove) => store.remove_card(&remove.id, options),
        EventBody::TextElementAdd(element) => {
            store.add_text_element(element.clone(), options);
            true
        }
        EventBody::TextElementPatch(patch) => store.update_text_element(patch.clone(), options),
        EventBody::TextElementRemove(remove) => store.remove_text_element(&remove.id, options),
        EventBody::PostItElementAdd(element) => {
            store.add_post_it(element.clone(), options);
            true
        }
        EventBody::PostItElementPatch(patch) => store.update_post_it(patch.clone(), options),
        EventBody::PostItElementRemove(remove) => store.remove_post_it(&remove.id, options),
        EventBody::DrawPathAdd(path) => {
            store.add_draw_path(path.clone(), options);
            true
        }
        EventBody::DrawPathPatch(path) => store.update_draw_path(path.clone(), options),
        EventBody::DrawPathRemove(remove) => store.remove_draw_path(&remove.id, options),
        EventBody::StateSnapshot(_) | EventBody::StateRequest(_) => false,
    }
}

#[cfg(test)]
#[path = "reconcile_test.rs"]
mod reconcile_test;

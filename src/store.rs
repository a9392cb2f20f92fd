//! Local mutation store: the single in-process owner of the live canvas.
//!
//! DESIGN
//! ======
//! Every UI interaction and every accepted remote event mutates the canvas
//! through this store. A mutation may do up to three things besides the
//! change itself:
//! - record the prior elements in undo history (skipped for remote origin),
//! - add a dirty reason telling the persistence coordinator a flush is due,
//! - queue an outbound event for broadcast (skipped while applying remote).
//!
//! The store never performs I/O. Other components read copies through
//! `snapshot()` and hand changes back as typed patches; nobody holds a
//! reference to the live canvas across an await.
//!
//! Mutations that target a missing id are no-ops returning `false`: a remote
//! delete racing a local edit is normal, not an error.

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;

use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::doc::{
    self, CanvasState, Card, CardPatch, Collection, DrawPath, Elements, Entity, Gender, LiveCanvas,
    PatientSettings, PostItElement, PostItPatch, TextElement, TextElementPatch, TherapistSettings,
};
use crate::event::{ClientId, EventBody, RemovePayload, SnapshotOrigin, SnapshotPayload};
use crate::history::{DEFAULT_HISTORY_LIMIT, History};

// =============================================================================
// DIRTY REASONS
// =============================================================================

/// Symbolic tag explaining why a flush is due. Decides whether to flush,
/// never what: a flush always writes the whole document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirtyReason {
    CardAdded,
    CardMoved,
    CardEdited,
    CardRemoved,
    TextAdded,
    TextMoved,
    TextEdited,
    TextRemoved,
    PostItAdded,
    PostItMoved,
    PostItEdited,
    PostItRemoved,
    DrawingAdded,
    DrawingEdited,
    DrawingRemoved,
    GenderChanged,
    SettingsChanged,
    HistoryUndo,
    HistoryRedo,
}

impl DirtyReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CardAdded => "card-added",
            Self::CardMoved => "card-moved",
            Self::CardEdited => "card-edited",
            Self::CardRemoved => "card-removed",
            Self::TextAdded => "text-added",
            Self::TextMoved => "text-moved",
            Self::TextEdited => "text-edited",
            Self::TextRemoved => "text-removed",
            Self::PostItAdded => "post-it-added",
            Self::PostItMoved => "post-it-moved",
            Self::PostItEdited => "post-it-edited",
            Self::PostItRemoved => "post-it-removed",
            Self::DrawingAdded => "drawing-added",
            Self::DrawingEdited => "drawing-edited",
            Self::DrawingRemoved => "drawing-removed",
            Self::GenderChanged => "gender-changed",
            Self::SettingsChanged => "settings-changed",
            Self::HistoryUndo => "history-undo",
            Self::HistoryRedo => "history-redo",
        }
    }
}

impl fmt::Display for DirtyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pending reasons. A set: repeating a reason before a flush adds nothing.
pub type DirtyReasons = BTreeSet<DirtyReason>;

// =============================================================================
// OPTIONS
// =============================================================================

/// Per-mutation options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationOptions {
    /// Do not record undo history. Set for remote- and snapshot-origin changes.
    pub skip_history: bool,
    /// Do not mark a dirty reason.
    pub skip_dirty: bool,
}

impl MutationOptions {
    /// A local user edit: recorded in history and marked dirty.
    #[must_use]
    pub fn local() -> Self {
        Self::default()
    }

    /// A change applied on behalf of another client.
    #[must_use]
    pub fn remote() -> Self {
        Self { skip_history: true, skip_dirty: false }
    }
}

// =============================================================================
// ENTITY WIRING
// =============================================================================

/// Ties an entity kind to its collection, dirty reasons, and event bodies.
trait Tracked: Entity {
    const ADDED: DirtyReason;
    const MOVED: DirtyReason;
    const EDITED: DirtyReason;
    const REMOVED: DirtyReason;

    fn collection(elements: &mut Elements) -> &mut Collection<Self>;
    fn add_event(entity: Self) -> EventBody;
    fn patch_event(patch: Self::Patch) -> EventBody;
    fn remove_event(id: String) -> EventBody;
}

impl Tracked for Card {
    const ADDED: DirtyReason = DirtyReason::CardAdded;
    const MOVED: DirtyReason = DirtyReason::CardMoved;
    const EDITED: DirtyReason = DirtyReason::CardEdited;
    const REMOVED: DirtyReason = DirtyReason::CardRemoved;

    fn collection(elements: &mut Elements) -> &mut Collection<Self> {
        &mut elements.cards
    }

    fn add_event(entity: Self) -> EventBody {
        EventBody::CardAdd(entity)
    }

    fn patch_event(patch: CardPatch) -> EventBody {
        EventBody::CardPatch(patch)
    }

    fn remove_event(id: String) -> EventBody {
        EventBody::CardRemove(RemovePayload { id })
    }
}

impl Tracked for TextElement {
    const ADDED: DirtyReason = DirtyReason::TextAdded;
    const MOVED: DirtyReason = DirtyReason::TextMoved;
    const EDITED: DirtyReason = DirtyReason::TextEdited;
    const REMOVED: DirtyReason = DirtyReason::TextRemoved;

    fn collection(elements: &mut Elements) -> &mut Collection<Self> {
        &mut elements.text_elements
    }

    fn add_event(entity: Self) -> EventBody {
        EventBody::TextElementAdd(entity)
    }

    fn patch_event(patch: TextElementPatch) -> EventBody {
        EventBody::TextElementPatch(patch)
    }

    fn remove_event(id: String) -> EventBody {
        EventBody::TextElementRemove(RemovePayload { id })
    }
}

impl Tracked for PostItElement {
    const ADDED: DirtyReason = DirtyReason::PostItAdded;
    const MOVED: DirtyReason = DirtyReason::PostItMoved;
    const EDITED: DirtyReason = DirtyReason::PostItEdited;
    const REMOVED: DirtyReason = DirtyReason::PostItRemoved;

    fn collection(elements: &mut Elements) -> &mut Collection<Self> {
        &mut elements.post_it_elements
    }

    fn add_event(entity: Self) -> EventBody {
        EventBody::PostItElementAdd(entity)
    }

    fn patch_event(patch: PostItPatch) -> EventBody {
        EventBody::PostItElementPatch(patch)
    }

    fn remove_event(id: String) -> EventBody {
        EventBody::PostItElementRemove(RemovePayload { id })
    }
}

impl Tracked for DrawPath {
    const ADDED: DirtyReason = DirtyReason::DrawingAdded;
    const MOVED: DirtyReason = DirtyReason::DrawingEdited;
    const EDITED: DirtyReason = DirtyReason::DrawingEdited;
    const REMOVED: DirtyReason = DirtyReason::DrawingRemoved;

    fn collection(elements: &mut Elements) -> &mut Collection<Self> {
        &mut elements.draw_paths
    }

    fn add_event(entity: Self) -> EventBody {
        EventBody::DrawPathAdd(entity)
    }

    fn patch_event(patch: DrawPath) -> EventBody {
        EventBody::DrawPathPatch(patch)
    }

    fn remove_event(id: String) -> EventBody {
        EventBody::DrawPathRemove(RemovePayload { id })
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Store handle shared between a session's message loop, its persistence
/// coordinator, and the UI. Never held across I/O.
pub type SharedStore = Arc<RwLock<MutationStore>>;

/// Owner of the live canvas for one client.
#[derive(Debug)]
pub struct MutationStore {
    client_id: ClientId,
    canvas: LiveCanvas,
    history: History,
    last_saved_version: u64,
    last_updated_at: Option<String>,
    dirty: DirtyReasons,
    applying_remote: bool,
    outbound: Vec<EventBody>,
}

impl MutationStore {
    /// An empty canvas that has never been persisted.
    #[must_use]
    pub fn new(client_id: ClientId) -> Self {
        Self::from_canvas(client_id, LiveCanvas::default(), DEFAULT_HISTORY_LIMIT)
    }

    /// Seed the store from a loaded document. The watermark starts at the
    /// document's stored version.
    #[must_use]
    pub fn from_canvas(client_id: ClientId, canvas: LiveCanvas, history_limit: usize) -> Self {
        Self {
            client_id,
            last_saved_version: canvas.version.unwrap_or(0),
            last_updated_at: canvas.updated_at.clone(),
            canvas,
            history: History::new(history_limit),
            dirty: DirtyReasons::new(),
            applying_remote: false,
            outbound: Vec::new(),
        }
    }

    /// Wrap for sharing across tasks.
    #[must_use]
    pub fn into_shared(self) -> SharedStore {
        Arc::new(RwLock::new(self))
    }

    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    #[must_use]
    pub fn canvas(&self) -> &LiveCanvas {
        &self.canvas
    }

    #[must_use]
    pub fn elements(&self) -> &Elements {
        &self.canvas.elements
    }

    /// Serialized copy of the live document.
    #[must_use]
    pub fn snapshot(&self) -> CanvasState {
        doc::serialize(&self.canvas)
    }

    /// The last version known to be durably persisted.
    #[must_use]
    pub fn last_saved_version(&self) -> u64 {
        self.last_saved_version
    }

    #[must_use]
    pub fn last_updated_at(&self) -> Option<&str> {
        self.last_updated_at.as_deref()
    }

    // -------------------------------------------------------------------------
    // Generic entity mutation
    // -------------------------------------------------------------------------

    fn before_mutation(&mut self, options: MutationOptions) {
        if !options.skip_history {
            self.history.record(self.canvas.elements.clone());
        }
    }

    fn after_mutation(&mut self, reason: DirtyReason, options: MutationOptions, event: EventBody) {
        if !options.skip_dirty {
            self.dirty.insert(reason);
        }
        if !self.applying_remote {
            self.outbound.push(event);
        }
    }

    fn insert<T: Tracked>(&mut self, mut entity: T, options: MutationOptions) {
        entity.normalize();
        self.before_mutation(options);
        T::collection(&mut self.canvas.elements).insert(entity.id().to_owned(), entity.clone());
        self.after_mutation(T::ADDED, options, T::add_event(entity));
    }

    fn patch<T: Tracked>(&mut self, patch: T::Patch, options: MutationOptions) -> bool {
        let id = T::patch_target(&patch).to_owned();
        if !T::collection(&mut self.canvas.elements).contains_key(&id) {
            debug!(%id, "patch on missing entity ignored");
            return false;
        }
        self.before_mutation(options);
        if let Some(entity) = T::collection(&mut self.canvas.elements).get_mut(&id) {
            entity.apply_patch(&patch);
        }
        let reason = if T::is_move(&patch) { T::MOVED } else { T::EDITED };
        self.after_mutation(reason, options, T::patch_event(patch));
        true
    }

    fn remove<T: Tracked>(&mut self, id: &str, options: MutationOptions) -> bool {
        if !T::collection(&mut self.canvas.elements).contains_key(id) {
            debug!(%id, "remove on missing entity ignored");
            return false;
        }
        self.before_mutation(options);
        T::collection(&mut self.canvas.elements).remove(id);
        self.after_mutation(T::REMOVED, options, T::remove_event(id.to_owned()));
        true
    }

    // -------------------------------------------------------------------------
    // Cards
    // -------------------------------------------------------------------------

    /// Add a card, replacing any card with the same id.
    pub fn add_card(&mut self, card: Card, options: MutationOptions) {
        self.insert(card, options);
    }

    pub fn update_card(&mut self, patch: CardPatch, options: MutationOptions) -> bool {
        self.patch::<Card>(patch, options)
    }

    pub fn remove_card(&mut self, id: &str, options: MutationOptions) -> bool {
        self.remove::<Card>(id, options)
    }

    // -------------------------------------------------------------------------
    // Text elements
    // -------------------------------------------------------------------------

    pub fn add_text_element(&mut self, element: TextElement, options: MutationOptions) {
        self.insert(element, options);
    }

    pub fn update_text_element(&mut self, patch: TextElementPatch, options: MutationOptions) -> bool {
        self.patch::<TextElement>(patch, options)
    }

    pub fn remove_text_element(&mut self, id: &str, options: MutationOptions) -> bool {
        self.remove::<TextElement>(id, options)
    }

    // -------------------------------------------------------------------------
    // Post-it elements
    // -------------------------------------------------------------------------

    pub fn add_post_it(&mut self, element: PostItElement, options: MutationOptions) {
        self.insert(element, options);
    }

    pub fn update_post_it(&mut self, patch: PostItPatch, options: MutationOptions) -> bool {
        self.patch::<PostItElement>(patch, options)
    }

    pub fn remove_post_it(&mut self, id: &str, options: MutationOptions) -> bool {
        self.remove::<PostItElement>(id, options)
    }

    // -------------------------------------------------------------------------
    // Draw paths
    // -------------------------------------------------------------------------

    pub fn add_draw_path(&mut self, path: DrawPath, options: MutationOptions) {
        self.insert(path, options);
    }

    /// Replace a stroke wholesale.
    pub fn update_draw_path(&mut self, path: DrawPath, options: MutationOptions) -> bool {
        self.patch::<DrawPath>(path, options)
    }

    pub fn remove_draw_path(&mut self, id: &str, options: MutationOptions) -> bool {
        self.remove::<DrawPath>(id, options)
    }

    // -------------------------------------------------------------------------
    // Presentation and view settings (not in history, not broadcast)
    // -------------------------------------------------------------------------

    pub fn set_gender(&mut self, gender: Gender) {
        if self.canvas.gender != gender {
            self.canvas.gender = gender;
            self.dirty.insert(DirtyReason::GenderChanged);
        }
    }

    pub fn update_patient_settings(&mut self, update: impl FnOnce(&mut PatientSettings)) {
        update(&mut self.canvas.patient_settings);
        self.dirty.insert(DirtyReason::SettingsChanged);
    }

    pub fn update_therapist_settings(&mut self, update: impl FnOnce(&mut TherapistSettings)) {
        update(&mut self.canvas.therapist_settings);
        self.dirty.insert(DirtyReason::SettingsChanged);
    }

    // -------------------------------------------------------------------------
    // Undo / redo
    // -------------------------------------------------------------------------

    /// Restore the elements from before the last local mutation. Queues a
    /// manual snapshot so peers converge on the restored state.
    pub fn undo(&mut self) -> bool {
        let Some(previous) = self.history.undo(&self.canvas.elements) else {
            return false;
        };
        self.restore(previous, DirtyReason::HistoryUndo);
        true
    }

    pub fn redo(&mut self) -> bool {
        let Some(next) = self.history.redo(&self.canvas.elements) else {
            return false;
        };
        self.restore(next, DirtyReason::HistoryRedo);
        true
    }

    fn restore(&mut self, elements: Elements, reason: DirtyReason) {
        self.canvas.elements = elements;
        self.dirty.insert(reason);
        if !self.applying_remote {
            self.outbound.push(EventBody::StateSnapshot(SnapshotPayload {
                state: self.snapshot(),
                origin: SnapshotOrigin::Manual,
            }));
        }
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    // -------------------------------------------------------------------------
    // Remote application
    // -------------------------------------------------------------------------

    /// Set or clear the remote-application flag. While set, mutations queue
    /// nothing for broadcast.
    pub fn mark_applying_remote(&mut self, applying: bool) {
        self.applying_remote = applying;
    }

    #[must_use]
    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote
    }

    /// Set the remote flag for the lifetime of the returned guard. Dropping the
    /// guard restores the previous value, so nested guards are safe.
    pub fn applying_remote(&mut self) -> RemoteApplyGuard<'_> {
        let previous = self.applying_remote;
        self.applying_remote = true;
        RemoteApplyGuard { store: self, previous }
    }

    /// Replace the live document with a remote or persisted snapshot.
    /// `replace_history` clears undo history; otherwise it is kept. Never
    /// marks dirty and never queues a broadcast.
    pub fn apply_snapshot(&mut self, state: &CanvasState, replace_history: bool) {
        self.canvas = doc::deserialize(Some(state));
        if replace_history {
            self.history.clear();
        }
    }

    // -------------------------------------------------------------------------
    // Persistence bookkeeping
    // -------------------------------------------------------------------------

    /// Record a confirmed durable write. The watermark never moves backwards.
    pub fn set_last_persisted_version(&mut self, version: u64, updated_at: Option<String>) {
        if version < self.last_saved_version {
            debug!(version, watermark = self.last_saved_version, "ignoring older persisted version");
            return;
        }
        self.last_saved_version = version;
        self.last_updated_at.clone_from(&updated_at);
        self.canvas.version = Some(version);
        self.canvas.updated_at = updated_at;
    }

    /// Take every pending reason, leaving the set empty.
    pub fn consume_dirty_reasons(&mut self) -> DirtyReasons {
        std::mem::take(&mut self.dirty)
    }

    /// Put reasons back after a failed flush.
    pub fn requeue_dirty_reasons(&mut self, reasons: DirtyReasons) {
        self.dirty.extend(reasons);
    }

    #[must_use]
    pub fn dirty_reasons(&self) -> &DirtyReasons {
        &self.dirty
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Take queued local changes for broadcast.
    pub fn drain_outbound(&mut self) -> Vec<EventBody> {
        std::mem::take(&mut self.outbound)
    }
}

// =============================================================================
// REMOTE APPLY GUARD
// =============================================================================

/// Scoped remote-application flag. Restores the prior flag on drop, including
/// during unwinding.
pub struct RemoteApplyGuard<'a> {
    store: &'a mut MutationStore,
    previous: bool,
}

impl Deref for RemoteApplyGuard<'_> {
    type Target = MutationStore;

    fn deref(&self) -> &MutationStore {
        self.store
    }
}

impl DerefMut for RemoteApplyGuard<'_> {
    fn deref_mut(&mut self) -> &mut MutationStore {
        self.store
    }
}

impl Drop for RemoteApplyGuard<'_> {
    fn drop(&mut self) {
        self.store.applying_remote = self.previous;
    }
}

//! Document model: canvas entities, the live document, and its persisted shape.
//!
//! This module defines what is on a session canvas (`Card`, `TextElement`,
//! `PostItElement`, `DrawPath`), sparse-update types for incremental edits
//! (`CardPatch`, `TextElementPatch`, `PostItPatch`), the live keyed document
//! owned by the mutation store (`LiveCanvas`), and the flat serializable
//! document written to storage and carried in snapshots (`CanvasState`).
//!
//! DESIGN
//! ======
//! Stored documents may have been written by older clients, so every read
//! path goes through lenient accessors that fill defaults instead of failing.
//! `CanvasState` and every entity deserialize from an arbitrary JSON value:
//! a non-object document becomes empty, an entity without an id is dropped,
//! and a missing or invalid geometry field gets its default. `serialize`
//! re-derives the same defaults on the way out rather than trusting callers.

#[cfg(test)]
#[path = "doc_test.rs"]
mod doc_test;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// DEFAULTS
// =============================================================================

pub const DEFAULT_CARD_WIDTH: f64 = 280.0;
pub const DEFAULT_CARD_HEIGHT: f64 = 320.0;
pub const DEFAULT_CARD_COLOR: &str = "#ffffff";
pub const DEFAULT_FONT_SIZE: f64 = 24.0;
pub const DEFAULT_TEXT_COLOR: &str = "#1f1f1f";
pub const DEFAULT_POST_IT_COLOR: &str = "#fff8b3";
pub const DEFAULT_STROKE_WIDTH: f64 = 3.0;
pub const DEFAULT_STROKE_COLOR: &str = "#1f1f1f";
pub const DEFAULT_ZOOM: f64 = 1.0;

/// Opaque, client-generated entity identifier. Unique within one collection.
pub type EntityId = String;

/// Entities of one kind keyed by id. Iteration order is by id, which keeps
/// serialized output deterministic.
pub type Collection<T> = BTreeMap<EntityId, T>;

/// Shape error for entities that cannot be recovered by defaulting.
#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("entity is not a JSON object")]
    NotAnObject,
    #[error("entity has no id")]
    MissingId,
}

// =============================================================================
// LENIENT ACCESSORS
// =============================================================================

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn string_or(value: &Value, key: &str, default: &str) -> String {
    str_field(value, key).unwrap_or(default).to_owned()
}

fn opt_string(value: &Value, key: &str) -> Option<String> {
    str_field(value, key).map(str::to_owned)
}

fn f64_field(value: &Value, key: &str) -> Option<f64> {
    value.get(key).and_then(Value::as_f64)
}

fn bool_field(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn id_field(value: &Value) -> Result<EntityId, ShapeError> {
    if !value.is_object() {
        return Err(ShapeError::NotAnObject);
    }
    match str_field(value, "id") {
        Some(id) if !id.is_empty() => Ok(id.to_owned()),
        _ => Err(ShapeError::MissingId),
    }
}

/// Positive finite dimension, or the default.
fn sanitize_dimension(value: f64, default: f64) -> f64 {
    if value.is_finite() && value > 0.0 { value } else { default }
}

fn sanitize_finite(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

// =============================================================================
// SHARED TYPES
// =============================================================================

/// A point in canvas world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn from_value(value: Option<&Value>) -> Self {
        let Some(value) = value else {
            return Self::default();
        };
        Self {
            x: sanitize_finite(f64_field(value, "x").unwrap_or(0.0)),
            y: sanitize_finite(f64_field(value, "y").unwrap_or(0.0)),
        }
    }

    fn sanitized(self) -> Self {
        Self { x: sanitize_finite(self.x), y: sanitize_finite(self.y) }
    }
}

/// Presentation mode used to pick gendered card content. Set by the
/// therapist; not reconciled concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    #[default]
    Neutral,
    Female,
    Male,
}

impl Gender {
    fn from_value(value: Option<&Value>) -> Option<Self> {
        match value.and_then(Value::as_str)? {
            "neutral" => Some(Self::Neutral),
            "female" => Some(Self::Female),
            "male" => Some(Self::Male),
            _ => None,
        }
    }
}

/// Which roles a card is locked against. Enforced by the UI; the core only
/// carries it through serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardLock {
    #[default]
    Unlocked,
    Patient,
    Therapist,
    Both,
}

impl CardLock {
    fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Bool(true)) => Self::Both,
            Some(Value::String(s)) => match s.as_str() {
                "patient" => Self::Patient,
                "therapist" => Self::Therapist,
                "both" => Self::Both,
                _ => Self::Unlocked,
            },
            _ => Self::Unlocked,
        }
    }
}

// =============================================================================
// ENTITY TRAIT
// =============================================================================

/// Common behavior of the four entity kinds.
pub trait Entity: Clone + PartialEq {
    /// Sparse update applied by `*.patch` mutations.
    type Patch: Clone;

    fn id(&self) -> &str;

    /// Id of the entity a patch targets.
    fn patch_target(patch: &Self::Patch) -> &str;

    /// True when the patch changes nothing but position.
    fn is_move(patch: &Self::Patch) -> bool;

    fn apply_patch(&mut self, patch: &Self::Patch);

    /// Re-derive defaults for optional numeric fields.
    fn normalize(&mut self);
}

// =============================================================================
// CARD
// =============================================================================

/// A therapy card placed on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "Value")]
pub struct Card {
    pub id: EntityId,
    pub position: Point,
    pub title: String,
    pub description: String,
    pub color: String,
    pub width: f64,
    pub height: f64,
    pub rotation: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    pub locked: CardLock,
}

impl Card {
    /// A card with default geometry and colors.
    #[must_use]
    pub fn new(id: impl Into<EntityId>, position: Point, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            position,
            title: title.into(),
            description: String::new(),
            color: DEFAULT_CARD_COLOR.to_owned(),
            width: DEFAULT_CARD_WIDTH,
            height: DEFAULT_CARD_HEIGHT,
            rotation: 0.0,
            image_url: None,
            category: None,
            card_number: None,
            gender: None,
            locked: CardLock::Unlocked,
        }
    }
}

impl TryFrom<Value> for Card {
    type Error = ShapeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let id = id_field(&value)?;
        let mut card = Self {
            id,
            position: Point::from_value(value.get("position")),
            title: string_or(&value, "title", ""),
            description: string_or(&value, "description", ""),
            color: string_or(&value, "color", DEFAULT_CARD_COLOR),
            width: f64_field(&value, "width").unwrap_or(DEFAULT_CARD_WIDTH),
            height: f64_field(&value, "height").unwrap_or(DEFAULT_CARD_HEIGHT),
            rotation: f64_field(&value, "rotation").unwrap_or(0.0),
            image_url: opt_string(&value, "imageUrl"),
            category: opt_string(&value, "category"),
            card_number: value
                .get("cardNumber")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok()),
            gender: Gender::from_value(value.get("gender")),
            locked: CardLock::from_value(value.get("locked")),
        };
        card.normalize();
        Ok(card)
    }
}

/// Sparse update for a card. Only present fields are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CardPatch {
    pub id: EntityId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    /// `Some(None)` (JSON `null`) clears the field.
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "clearable")]
    pub image_url: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "clearable")]
    pub category: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "clearable")]
    pub card_number: Option<Option<u32>>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "clearable")]
    pub gender: Option<Option<Gender>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked: Option<CardLock>,
}

/// Absent stays `None`; an explicit `null` becomes `Some(None)`.
fn clearable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl CardPatch {
    #[must_use]
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self { id: id.into(), ..Self::default() }
    }

    #[must_use]
    pub fn moved_to(id: impl Into<EntityId>, position: Point) -> Self {
        Self { id: id.into(), position: Some(position), ..Self::default() }
    }
}

impl Entity for Card {
    type Patch = CardPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn patch_target(patch: &CardPatch) -> &str {
        &patch.id
    }

    fn is_move(patch: &CardPatch) -> bool {
        patch.position.is_some() && *patch == CardPatch { position: patch.position, ..CardPatch::new(patch.id.clone()) }
    }

    fn apply_patch(&mut self, patch: &CardPatch) {
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(ref title) = patch.title {
            self.title.clone_from(title);
        }
        if let Some(ref description) = patch.description {
            self.description.clone_from(description);
        }
        if let Some(ref color) = patch.color {
            self.color.clone_from(color);
        }
        if let Some(width) = patch.width {
            self.width = width;
        }
        if let Some(height) = patch.height {
            self.height = height;
        }
        if let Some(rotation) = patch.rotation {
            self.rotation = rotation;
        }
        if let Some(ref url) = patch.image_url {
            self.image_url.clone_from(url);
        }
        if let Some(ref category) = patch.category {
            self.category.clone_from(category);
        }
        if let Some(card_number) = patch.card_number {
            self.card_number = card_number;
        }
        if let Some(gender) = patch.gender {
            self.gender = gender;
        }
        if let Some(locked) = patch.locked {
            self.locked = locked;
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        self.position = self.position.sanitized();
        self.width = sanitize_dimension(self.width, DEFAULT_CARD_WIDTH);
        self.height = sanitize_dimension(self.height, DEFAULT_CARD_HEIGHT);
        self.rotation = sanitize_finite(self.rotation);
    }
}

// =============================================================================
// TEXT ELEMENT
// =============================================================================

/// Free text placed on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "Value")]
pub struct TextElement {
    pub id: EntityId,
    pub position: Point,
    pub text: String,
    pub font_size: f64,
    pub color: String,
    pub bold: bool,
    pub underline: bool,
    /// Local UI flag, persisted so a reload resumes in the same state.
    pub is_editing: bool,
}

impl TextElement {
    #[must_use]
    pub fn new(id: impl Into<EntityId>, position: Point, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            position,
            text: text.into(),
            font_size: DEFAULT_FONT_SIZE,
            color: DEFAULT_TEXT_COLOR.to_owned(),
            bold: false,
            underline: false,
            is_editing: false,
        }
    }
}

impl TryFrom<Value> for TextElement {
    type Error = ShapeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let id = id_field(&value)?;
        let mut element = Self {
            id,
            position: Point::from_value(value.get("position")),
            text: string_or(&value, "text", ""),
            font_size: f64_field(&value, "fontSize").unwrap_or(DEFAULT_FONT_SIZE),
            color: string_or(&value, "color", DEFAULT_TEXT_COLOR),
            bold: bool_field(&value, "bold"),
            underline: bool_field(&value, "underline"),
            is_editing: bool_field(&value, "isEditing"),
        };
        element.normalize();
        Ok(element)
    }
}

/// Sparse update for a text element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TextElementPatch {
    pub id: EntityId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bold: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub underline: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_editing: Option<bool>,
}

impl TextElementPatch {
    #[must_use]
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self { id: id.into(), ..Self::default() }
    }
}

impl Entity for TextElement {
    type Patch = TextElementPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn patch_target(patch: &TextElementPatch) -> &str {
        &patch.id
    }

    fn is_move(patch: &TextElementPatch) -> bool {
        patch.position.is_some()
            && *patch == TextElementPatch { position: patch.position, ..TextElementPatch::new(patch.id.clone()) }
    }

    fn apply_patch(&mut self, patch: &TextElementPatch) {
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(ref text) = patch.text {
            self.text.clone_from(text);
        }
        if let Some(font_size) = patch.font_size {
            self.font_size = font_size;
        }
        if let Some(ref color) = patch.color {
            self.color.clone_from(color);
        }
        if let Some(bold) = patch.bold {
            self.bold = bold;
        }
        if let Some(underline) = patch.underline {
            self.underline = underline;
        }
        if let Some(is_editing) = patch.is_editing {
            self.is_editing = is_editing;
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        self.position = self.position.sanitized();
        self.font_size = sanitize_dimension(self.font_size, DEFAULT_FONT_SIZE);
    }
}

// =============================================================================
// POST-IT ELEMENT
// =============================================================================

/// A sticky note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "Value")]
pub struct PostItElement {
    pub id: EntityId,
    pub position: Point,
    pub text: String,
    pub color: String,
    pub is_editing: bool,
}

impl PostItElement {
    #[must_use]
    pub fn new(id: impl Into<EntityId>, position: Point, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            position,
            text: text.into(),
            color: DEFAULT_POST_IT_COLOR.to_owned(),
            is_editing: false,
        }
    }
}

impl TryFrom<Value> for PostItElement {
    type Error = ShapeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let id = id_field(&value)?;
        let mut element = Self {
            id,
            position: Point::from_value(value.get("position")),
            text: string_or(&value, "text", ""),
            color: string_or(&value, "color", DEFAULT_POST_IT_COLOR),
            is_editing: bool_field(&value, "isEditing"),
        };
        element.normalize();
        Ok(element)
    }
}

/// Sparse update for a sticky note.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostItPatch {
    pub id: EntityId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_editing: Option<bool>,
}

impl PostItPatch {
    #[must_use]
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self { id: id.into(), ..Self::default() }
    }
}

impl Entity for PostItElement {
    type Patch = PostItPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn patch_target(patch: &PostItPatch) -> &str {
        &patch.id
    }

    fn is_move(patch: &PostItPatch) -> bool {
        patch.position.is_some() && *patch == PostItPatch { position: patch.position, ..PostItPatch::new(patch.id.clone()) }
    }

    fn apply_patch(&mut self, patch: &PostItPatch) {
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(ref text) = patch.text {
            self.text.clone_from(text);
        }
        if let Some(ref color) = patch.color {
            self.color.clone_from(color);
        }
        if let Some(is_editing) = patch.is_editing {
            self.is_editing = is_editing;
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        self.position = self.position.sanitized();
    }
}

// =============================================================================
// DRAW PATH
// =============================================================================

/// A freehand stroke. Atomic: a patch replaces the whole stroke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "Value")]
pub struct DrawPath {
    pub id: EntityId,
    pub points: Vec<Point>,
    pub width: f64,
    pub color: String,
}

impl DrawPath {
    #[must_use]
    pub fn new(id: impl Into<EntityId>, points: Vec<Point>) -> Self {
        Self { id: id.into(), points, width: DEFAULT_STROKE_WIDTH, color: DEFAULT_STROKE_COLOR.to_owned() }
    }
}

impl TryFrom<Value> for DrawPath {
    type Error = ShapeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let id = id_field(&value)?;
        let points = value
            .get("points")
            .and_then(Value::as_array)
            .map(|points| points.iter().map(|p| Point::from_value(Some(p))).collect())
            .unwrap_or_default();
        let mut path = Self {
            id,
            points,
            width: f64_field(&value, "width").unwrap_or(DEFAULT_STROKE_WIDTH),
            color: string_or(&value, "color", DEFAULT_STROKE_COLOR),
        };
        path.normalize();
        Ok(path)
    }
}

impl Entity for DrawPath {
    type Patch = DrawPath;

    fn id(&self) -> &str {
        &self.id
    }

    fn patch_target(patch: &DrawPath) -> &str {
        &patch.id
    }

    fn is_move(_patch: &DrawPath) -> bool {
        false
    }

    fn apply_patch(&mut self, patch: &DrawPath) {
        self.points.clone_from(&patch.points);
        self.width = patch.width;
        self.color.clone_from(&patch.color);
        self.normalize();
    }

    fn normalize(&mut self) {
        for point in &mut self.points {
            *point = point.sanitized();
        }
        self.width = sanitize_dimension(self.width, DEFAULT_STROKE_WIDTH);
    }
}

// =============================================================================
// VIEW SETTINGS
// =============================================================================

/// Patient-side view state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientSettings {
    pub zoom: f64,
}

impl Default for PatientSettings {
    fn default() -> Self {
        Self { zoom: DEFAULT_ZOOM }
    }
}

/// Therapist-side view state, including private session notes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TherapistSettings {
    pub zoom: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

impl Default for TherapistSettings {
    fn default() -> Self {
        Self { zoom: DEFAULT_ZOOM, notes: String::new() }
    }
}

fn zoom_from(value: Option<&Value>) -> f64 {
    let zoom = value
        .and_then(|v| f64_field(v, "zoom"))
        .unwrap_or(DEFAULT_ZOOM);
    sanitize_dimension(zoom, DEFAULT_ZOOM)
}

// =============================================================================
// LIVE DOCUMENT
// =============================================================================

/// The four entity collections. This is what undo/redo snapshots capture.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Elements {
    pub cards: Collection<Card>,
    pub text_elements: Collection<TextElement>,
    pub post_it_elements: Collection<PostItElement>,
    pub draw_paths: Collection<DrawPath>,
}

impl Elements {
    /// Total entity count across all collections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cards.len() + self.text_elements.len() + self.post_it_elements.len() + self.draw_paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The in-memory document owned by the mutation store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LiveCanvas {
    pub elements: Elements,
    pub gender: Gender,
    pub patient_settings: PatientSettings,
    pub therapist_settings: TherapistSettings,
    /// `None` for a document that has never been persisted.
    pub version: Option<u64>,
    pub updated_at: Option<String>,
}

// =============================================================================
// PERSISTED DOCUMENT
// =============================================================================

/// The serializable document: what storage holds and snapshots carry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "Value")]
pub struct CanvasState {
    pub cards: Vec<Card>,
    pub text_elements: Vec<TextElement>,
    pub post_it_elements: Vec<PostItElement>,
    pub draw_paths: Vec<DrawPath>,
    pub gender: Gender,
    pub patient_settings: PatientSettings,
    pub therapist_settings: TherapistSettings,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

fn entities_from<T>(value: &Value, key: &str) -> Vec<T>
where
    T: TryFrom<Value, Error = ShapeError>,
{
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| T::try_from(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

impl CanvasState {
    /// Leniently read a stored document. Returns `None` when the value is
    /// not a JSON object at all (treated like a missing document).
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let therapist = value.get("therapistSettings");
        Some(Self {
            cards: entities_from(value, "cards"),
            text_elements: entities_from(value, "textElements"),
            post_it_elements: entities_from(value, "postItElements"),
            draw_paths: entities_from(value, "drawPaths"),
            gender: Gender::from_value(value.get("gender")).unwrap_or_default(),
            patient_settings: PatientSettings { zoom: zoom_from(value.get("patientSettings")) },
            therapist_settings: TherapistSettings {
                zoom: zoom_from(therapist),
                notes: therapist
                    .map(|t| string_or(t, "notes", ""))
                    .unwrap_or_default(),
            },
            version: value.get("version").and_then(Value::as_u64).unwrap_or(0),
            updated_at: opt_string(value, "updatedAt"),
        })
    }
}

impl From<Value> for CanvasState {
    fn from(value: Value) -> Self {
        Self::from_value(&value).unwrap_or_default()
    }
}

fn normalized<T: Entity>(entity: &T) -> T {
    let mut entity = entity.clone();
    entity.normalize();
    entity
}

fn keyed<T: Entity>(entities: &[T]) -> Collection<T> {
    entities
        .iter()
        .map(|entity| (entity.id().to_owned(), normalized(entity)))
        .collect()
}

/// Produce the persisted shape of a live document, re-deriving geometry
/// defaults for every entity.
#[must_use]
pub fn serialize(live: &LiveCanvas) -> CanvasState {
    let elements = &live.elements;
    CanvasState {
        cards: elements.cards.values().map(normalized).collect(),
        text_elements: elements.text_elements.values().map(normalized).collect(),
        post_it_elements: elements.post_it_elements.values().map(normalized).collect(),
        draw_paths: elements.draw_paths.values().map(normalized).collect(),
        gender: live.gender,
        patient_settings: PatientSettings { zoom: sanitize_dimension(live.patient_settings.zoom, DEFAULT_ZOOM) },
        therapist_settings: TherapistSettings {
            zoom: sanitize_dimension(live.therapist_settings.zoom, DEFAULT_ZOOM),
            notes: live.therapist_settings.notes.clone(),
        },
        version: live.version.unwrap_or(0),
        updated_at: live.updated_at.clone(),
    }
}

/// Build a live document from a persisted one. A missing document yields an
/// empty canvas with no version. Duplicate ids keep the last occurrence.
#[must_use]
pub fn deserialize(state: Option<&CanvasState>) -> LiveCanvas {
    let Some(state) = state else {
        return LiveCanvas::default();
    };
    LiveCanvas {
        elements: Elements {
            cards: keyed(&state.cards),
            text_elements: keyed(&state.text_elements),
            post_it_elements: keyed(&state.post_it_elements),
            draw_paths: keyed(&state.draw_paths),
        },
        gender: state.gender,
        patient_settings: PatientSettings { zoom: sanitize_dimension(state.patient_settings.zoom, DEFAULT_ZOOM) },
        therapist_settings: TherapistSettings {
            zoom: sanitize_dimension(state.therapist_settings.zoom, DEFAULT_ZOOM),
            notes: state.therapist_settings.notes.clone(),
        },
        version: Some(state.version),
        updated_at: state.updated_at.clone(),
    }
}

/// Deserialize straight from a stored JSON value of unknown shape.
#[must_use]
pub fn deserialize_value(value: Option<&Value>) -> LiveCanvas {
    let state = value.and_then(CanvasState::from_value);
    deserialize(state.as_ref())
}

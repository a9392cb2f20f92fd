//! Sync events: the typed messages carried on a session's realtime channel.
//!
//! ARCHITECTURE
//! ============
//! Every realtime communication between collaborators is a `SyncEvent`. A
//! client publishes one per local mutation; peers feed each inbound event to
//! their reconciler. Events are tagged with the originating `ClientId` (for
//! self-echo suppression) and, for mutations, the document version the sender
//! was editing against (for staleness rejection).
//!
//! DESIGN
//! ======
//! - Wire shape is flat JSON: `{id, sessionId, clientId, type, payload,
//!   version?, ts}` where `type` is a dotted name such as `card.patch`.
//! - In memory the payload is a typed `EventBody`; conversion to and from the
//!   wire shape happens once in `WireEvent`, so nothing downstream inspects
//!   raw JSON.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::doc::{
    CanvasState, Card, CardPatch, DrawPath, EntityId, PostItElement, PostItPatch, TextElement, TextElementPatch,
};

// =============================================================================
// IDENTITY
// =============================================================================

/// Identity of one in-process session object (one browser tab). Generated
/// once and injected wherever self-origin must be recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error reporting.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("unknown event type: {0}")]
    UnknownType(String),
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: EventType,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed event: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("event encode failed: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ErrorCode for EventError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownType(_) => "E_EVENT_UNKNOWN_TYPE",
            Self::Payload { .. } => "E_EVENT_PAYLOAD",
            Self::Malformed(_) => "E_EVENT_MALFORMED",
            Self::Encode(_) => "E_EVENT_ENCODE",
        }
    }
}

// =============================================================================
// EVENT TYPES
// =============================================================================

/// Dotted event names as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    CardAdd,
    CardPatch,
    CardRemove,
    TextElementAdd,
    TextElementPatch,
    TextElementRemove,
    PostItElementAdd,
    PostItElementPatch,
    PostItElementRemove,
    DrawPathAdd,
    DrawPathPatch,
    DrawPathRemove,
    StateSnapshot,
    StateRequest,
}

impl EventType {
    pub const ALL: [EventType; 14] = [
        Self::CardAdd,
        Self::CardPatch,
        Self::CardRemove,
        Self::TextElementAdd,
        Self::TextElementPatch,
        Self::TextElementRemove,
        Self::PostItElementAdd,
        Self::PostItElementPatch,
        Self::PostItElementRemove,
        Self::DrawPathAdd,
        Self::DrawPathPatch,
        Self::DrawPathRemove,
        Self::StateSnapshot,
        Self::StateRequest,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CardAdd => "card.add",
            Self::CardPatch => "card.patch",
            Self::CardRemove => "card.remove",
            Self::TextElementAdd => "textElement.add",
            Self::TextElementPatch => "textElement.patch",
            Self::TextElementRemove => "textElement.remove",
            Self::PostItElementAdd => "postItElement.add",
            Self::PostItElementPatch => "postItElement.patch",
            Self::PostItElementRemove => "postItElement.remove",
            Self::DrawPathAdd => "drawPath.add",
            Self::DrawPathPatch => "drawPath.patch",
            Self::DrawPathRemove => "drawPath.remove",
            Self::StateSnapshot => "state.snapshot",
            Self::StateRequest => "state.request",
        }
    }

    /// Parse a dotted wire name.
    ///
    /// # Errors
    ///
    /// Returns `UnknownType` for names outside the taxonomy.
    pub fn parse(name: &str) -> Result<Self, EventError> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == name)
            .ok_or_else(|| EventError::UnknownType(name.to_owned()))
    }

    /// Entity-level mutations are subject to staleness rejection.
    #[must_use]
    pub fn is_entity_mutation(self) -> bool {
        !matches!(self, Self::StateSnapshot | Self::StateRequest)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a full-state snapshot was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotOrigin {
    /// A user-triggered undo/redo.
    Manual,
    /// A reply to `state.request`.
    Resync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovePayload {
    pub id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub state: CanvasState,
    pub origin: SnapshotOrigin,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRequestPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_version: Option<u64>,
}

/// Typed event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    CardAdd(Card),
    CardPatch(CardPatch),
    CardRemove(RemovePayload),
    TextElementAdd(TextElement),
    TextElementPatch(TextElementPatch),
    TextElementRemove(RemovePayload),
    PostItElementAdd(PostItElement),
    PostItElementPatch(PostItPatch),
    PostItElementRemove(RemovePayload),
    DrawPathAdd(DrawPath),
    DrawPathPatch(DrawPath),
    DrawPathRemove(RemovePayload),
    StateSnapshot(SnapshotPayload),
    StateRequest(StateRequestPayload),
}

impl EventBody {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::CardAdd(_) => EventType::CardAdd,
            Self::CardPatch(_) => EventType::CardPatch,
            Self::CardRemove(_) => EventType::CardRemove,
            Self::TextElementAdd(_) => EventType::TextElementAdd,
            Self::TextElementPatch(_) => EventType::TextElementPatch,
            Self::TextElementRemove(_) => EventType::TextElementRemove,
            Self::PostItElementAdd(_) => EventType::PostItElementAdd,
            Self::PostItElementPatch(_) => EventType::PostItElementPatch,
            Self::PostItElementRemove(_) => EventType::PostItElementRemove,
            Self::DrawPathAdd(_) => EventType::DrawPathAdd,
            Self::DrawPathPatch(_) => EventType::DrawPathPatch,
            Self::DrawPathRemove(_) => EventType::DrawPathRemove,
            Self::StateSnapshot(_) => EventType::StateSnapshot,
            Self::StateRequest(_) => EventType::StateRequest,
        }
    }

    fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::CardAdd(p) => serde_json::to_value(p),
            Self::CardPatch(p) => serde_json::to_value(p),
            Self::TextElementAdd(p) => serde_json::to_value(p),
            Self::TextElementPatch(p) => serde_json::to_value(p),
            Self::PostItElementAdd(p) => serde_json::to_value(p),
            Self::PostItElementPatch(p) => serde_json::to_value(p),
            Self::DrawPathAdd(p) | Self::DrawPathPatch(p) => serde_json::to_value(p),
            Self::CardRemove(p) | Self::TextElementRemove(p) | Self::PostItElementRemove(p) | Self::DrawPathRemove(p) => {
                serde_json::to_value(p)
            }
            Self::StateSnapshot(p) => serde_json::to_value(p),
            Self::StateRequest(p) => serde_json::to_value(p),
        }
    }

    fn from_payload(kind: EventType, payload: Value) -> Result<Self, EventError> {
        let wrap = |source| EventError::Payload { kind, source };
        let body = match kind {
            EventType::CardAdd => Self::CardAdd(serde_json::from_value(payload).map_err(wrap)?),
            EventType::CardPatch => Self::CardPatch(serde_json::from_value(payload).map_err(wrap)?),
            EventType::CardRemove => Self::CardRemove(serde_json::from_value(payload).map_err(wrap)?),
            EventType::TextElementAdd => Self::TextElementAdd(serde_json::from_value(payload).map_err(wrap)?),
            EventType::TextElementPatch => Self::TextElementPatch(serde_json::from_value(payload).map_err(wrap)?),
            EventType::TextElementRemove => Self::TextElementRemove(serde_json::from_value(payload).map_err(wrap)?),
            EventType::PostItElementAdd => Self::PostItElementAdd(serde_json::from_value(payload).map_err(wrap)?),
            EventType::PostItElementPatch => Self::PostItElementPatch(serde_json::from_value(payload).map_err(wrap)?),
            EventType::PostItElementRemove => {
                Self::PostItElementRemove(serde_json::from_value(payload).map_err(wrap)?)
            }
            EventType::DrawPathAdd => Self::DrawPathAdd(serde_json::from_value(payload).map_err(wrap)?),
            EventType::DrawPathPatch => Self::DrawPathPatch(serde_json::from_value(payload).map_err(wrap)?),
            EventType::DrawPathRemove => Self::DrawPathRemove(serde_json::from_value(payload).map_err(wrap)?),
            EventType::StateSnapshot => Self::StateSnapshot(serde_json::from_value(payload).map_err(wrap)?),
            EventType::StateRequest => Self::StateRequest(serde_json::from_value(payload).map_err(wrap)?),
        };
        Ok(body)
    }
}

// =============================================================================
// EVENT
// =============================================================================

/// One message on a session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEvent", into = "WireEvent")]
pub struct SyncEvent {
    pub id: Uuid,
    pub session_id: String,
    pub client_id: ClientId,
    pub body: EventBody,
    /// Document version the sender was editing against.
    pub version: Option<u64>,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    pub ts: i64,
}

impl SyncEvent {
    pub fn new(session_id: impl Into<String>, client_id: ClientId, body: EventBody) -> Self {
        Self { id: Uuid::new_v4(), session_id: session_id.into(), client_id, body, version: None, ts: now_ms() }
    }

    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.body.event_type()
    }

    /// Encode to the JSON wire text.
    ///
    /// # Errors
    ///
    /// Returns `Encode` if a payload cannot be represented as JSON.
    pub fn encode(&self) -> Result<String, EventError> {
        let wire = WireEvent::try_from_event(self)?;
        serde_json::to_string(&wire).map_err(EventError::Encode)
    }

    /// Decode from JSON wire text.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid JSON, unknown types, or malformed payloads.
    pub fn decode(text: &str) -> Result<Self, EventError> {
        let wire: WireEvent = serde_json::from_str(text).map_err(EventError::Malformed)?;
        Self::try_from(wire)
    }
}

/// Flat wire representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    pub id: Uuid,
    pub session_id: String,
    pub client_id: ClientId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default)]
    pub ts: i64,
}

impl WireEvent {
    fn try_from_event(event: &SyncEvent) -> Result<Self, EventError> {
        Ok(Self {
            id: event.id,
            session_id: event.session_id.clone(),
            client_id: event.client_id,
            kind: event.event_type().as_str().to_owned(),
            payload: event.body.to_payload().map_err(EventError::Encode)?,
            version: event.version,
            ts: event.ts,
        })
    }
}

impl TryFrom<WireEvent> for SyncEvent {
    type Error = EventError;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let kind = EventType::parse(&wire.kind)?;
        Ok(Self {
            id: wire.id,
            session_id: wire.session_id,
            client_id: wire.client_id,
            body: EventBody::from_payload(kind, wire.payload)?,
            version: wire.version,
            ts: wire.ts,
        })
    }
}

impl From<SyncEvent> for WireEvent {
    fn from(event: SyncEvent) -> Self {
        // Entity and snapshot payloads are plain data; encoding cannot fail.
        let payload = event.body.to_payload().unwrap_or(Value::Null);
        Self {
            id: event.id,
            session_id: event.session_id,
            client_id: event.client_id,
            kind: event.body.event_type().as_str().to_owned(),
            payload,
            version: event.version,
            ts: event.ts,
        }
    }
}

// =============================================================================
// CLOCK
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

/// Current time as an RFC 3339 / ISO-8601 timestamp.
#[must_use]
pub fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;

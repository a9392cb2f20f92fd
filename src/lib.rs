//! Real-time synchronization core for a shared therapy canvas.
//!
//! Two or three participants edit one board concurrently: cards, free text,
//! sticky notes, and freehand paths. Each client keeps the authoritative copy
//! of the document in memory, broadcasts typed mutation events to its peers,
//! reconciles their events against a persisted-version watermark, and
//! flushes the whole document to durable storage on a timer.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`doc`] | Document model, persisted shape, lenient (de)serialization |
//! | [`store`] | Mutation store: dirty reasons, undo/redo, remote-apply guard |
//! | [`history`] | Bounded undo/redo stacks |
//! | [`event`] | Event taxonomy and JSON wire codec |
//! | [`channel`] | Broadcast channel trait, in-process hub, WebSocket transport |
//! | [`reconcile`] | Inbound event handling: echo, staleness, snapshots, requests |
//! | [`persistence`] | Sinks, flush state machine, autosave driver |
//! | [`session`] | Wires the above into one client's live session |
//! | [`config`] | Environment-driven settings |

pub mod channel;
pub mod config;
pub mod doc;
pub mod event;
pub mod history;
pub mod persistence;
pub mod reconcile;
pub mod session;
pub mod store;

pub use channel::{Channel, ChannelSignal, ChannelStatus, LocalHub, WsChannel};
pub use config::{SessionSinks, SyncConfig};
pub use doc::CanvasState;
pub use event::{ClientId, SyncEvent};
pub use persistence::{PersistenceCoordinator, PersistenceSink};
pub use session::{SessionHandle, SessionOptions, SyncSession};
pub use store::MutationStore;

//! Realtime broadcast channel: a per-session publish/subscribe topic.
//!
//! DESIGN
//! ======
//! A channel is created for one `(session_id, client_id)` pair. `subscribe`
//! hands back a bounded receiver of `ChannelSignal`s carrying both inbound
//! events and connection-state transitions, so the owner drives everything
//! from one message loop. `publish` awaits the transport's acknowledgment of
//! the send before returning.
//!
//! Delivery is best-effort and at-most-once. Nothing is replayed: events sent
//! while a client is disconnected are lost for that client, which is why the
//! session asks peers for state as soon as a subscription is (re)established.
//!
//! Implementations:
//! - `LocalHub`/`HubChannel`: in-process fan-out, used in tests and
//!   single-process setups. Supports simulated disconnects.
//! - `WsChannel`: WebSocket client for the relay server with exponential
//!   reconnect backoff.

mod hub;
mod ws;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::event::{ErrorCode, EventError, SyncEvent};

pub use hub::{HubChannel, LocalHub};
pub use ws::WsChannel;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;

// =============================================================================
// TYPES
// =============================================================================

/// Connection state of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Subscribed,
    Closed,
    Errored(String),
}

/// Everything a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    Event(SyncEvent),
    Status(ChannelStatus),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is not subscribed")]
    Closed,
    #[error("channel is disconnected")]
    Disconnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Encode(#[from] EventError),
}

impl ErrorCode for ChannelError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Closed => "E_CHANNEL_CLOSED",
            Self::Disconnected => "E_CHANNEL_DISCONNECTED",
            Self::Transport(_) => "E_CHANNEL_TRANSPORT",
            Self::Encode(_) => "E_CHANNEL_ENCODE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Transport(_))
    }
}

// =============================================================================
// CHANNEL
// =============================================================================

#[async_trait]
pub trait Channel: Send + Sync {
    fn session_id(&self) -> &str;

    /// Send an event to every subscriber of the session. Returns once the
    /// transport has accepted the send.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not subscribed, currently disconnected, or the
    /// transport rejects the write.
    async fn publish(&self, event: &SyncEvent) -> Result<(), ChannelError>;

    /// Start receiving events and status changes. Subscribing again replaces
    /// the previous subscription.
    ///
    /// # Errors
    ///
    /// Fails if the transport cannot be started.
    async fn subscribe(&self) -> Result<mpsc::Receiver<ChannelSignal>, ChannelError>;

    /// Stop receiving. Idempotent.
    async fn unsubscribe(&self);
}

// =============================================================================
// BACKOFF
// =============================================================================

/// Exponential reconnect delay: doubles after every failure up to `max`,
/// back to `base` after a successful connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self { base, max, current: base }
    }

    /// Delay to wait now. Advances the next delay.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
        )
    }
}

//! In-process session hub.
//!
//! Every `HubChannel` created from the same `LocalHub` with the same session
//! id shares one topic. Published events go through the JSON wire codec and
//! fan out to all connected members, the sender included, exactly as a
//! broadcast transport with self-delivery would. Full member queues are
//! skipped rather than awaited.
//!
//! `disconnect`/`reconnect` simulate network loss for one member: while
//! disconnected it neither sends nor receives, and on reconnect it sees the
//! `Connecting -> Subscribed` transition a real transport would emit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use super::{Channel, ChannelError, ChannelSignal, ChannelStatus, DEFAULT_CHANNEL_CAPACITY};
use crate::event::{ClientId, SyncEvent};

struct Member {
    tx: mpsc::Sender<ChannelSignal>,
    connected: bool,
}

type Rooms = HashMap<String, HashMap<ClientId, Member>>;

/// Shared in-memory broadcast topics, keyed by session id.
#[derive(Clone)]
pub struct LocalHub {
    rooms: Arc<RwLock<Rooms>>,
    capacity: usize,
}

impl LocalHub {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { rooms: Arc::new(RwLock::new(HashMap::new())), capacity: capacity.max(2) }
    }

    /// A channel handle for one client in one session.
    pub fn channel(&self, session_id: impl Into<String>, client_id: ClientId) -> HubChannel {
        HubChannel { hub: self.clone(), session_id: session_id.into(), client_id }
    }

    /// Drop one member off the network. Returns `false` if it is not subscribed.
    pub async fn disconnect(&self, session_id: &str, client_id: ClientId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(member) = rooms.get_mut(session_id).and_then(|room| room.get_mut(&client_id)) else {
            return false;
        };
        member.connected = false;
        notify(member, ChannelStatus::Closed);
        debug!(%session_id, %client_id, "hub member disconnected");
        true
    }

    /// Bring a disconnected member back. Returns `false` if it is not subscribed.
    pub async fn reconnect(&self, session_id: &str, client_id: ClientId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(member) = rooms.get_mut(session_id).and_then(|room| room.get_mut(&client_id)) else {
            return false;
        };
        member.connected = true;
        notify(member, ChannelStatus::Connecting);
        notify(member, ChannelStatus::Subscribed);
        debug!(%session_id, %client_id, "hub member reconnected");
        true
    }

    /// Number of subscribed members in a session, connected or not.
    pub async fn member_count(&self, session_id: &str) -> usize {
        self.rooms.read().await.get(session_id).map_or(0, HashMap::len)
    }

    async fn join(&self, session_id: &str, client_id: ClientId) -> mpsc::Receiver<ChannelSignal> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let member = Member { tx, connected: true };
        notify(&member, ChannelStatus::Connecting);
        notify(&member, ChannelStatus::Subscribed);

        let mut rooms = self.rooms.write().await;
        rooms.entry(session_id.to_owned()).or_default().insert(client_id, member);
        rx
    }

    async fn part(&self, session_id: &str, client_id: ClientId) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(session_id) else {
            return;
        };
        if let Some(member) = room.remove(&client_id) {
            notify(&member, ChannelStatus::Closed);
        }
        if room.is_empty() {
            rooms.remove(session_id);
        }
    }

    async fn fan_out(&self, session_id: &str, sender: ClientId, event: &SyncEvent) -> Result<(), ChannelError> {
        let rooms = self.rooms.read().await;
        let member = rooms
            .get(session_id)
            .and_then(|room| room.get(&sender))
            .ok_or(ChannelError::Closed)?;
        if !member.connected {
            return Err(ChannelError::Disconnected);
        }

        let delivered = SyncEvent::decode(&event.encode()?)?;
        let Some(room) = rooms.get(session_id) else {
            return Ok(());
        };
        for (client_id, member) in room {
            if !member.connected {
                continue;
            }
            if member.tx.try_send(ChannelSignal::Event(delivered.clone())).is_err() {
                debug!(%session_id, %client_id, "hub member queue full; event dropped");
            }
        }
        Ok(())
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

fn notify(member: &Member, status: ChannelStatus) {
    let _ = member.tx.try_send(ChannelSignal::Status(status));
}

/// One client's handle on a `LocalHub` topic.
pub struct HubChannel {
    hub: LocalHub,
    session_id: String,
    client_id: ClientId,
}

impl HubChannel {
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }
}

#[async_trait]
impl Channel for HubChannel {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn publish(&self, event: &SyncEvent) -> Result<(), ChannelError> {
        self.hub.fan_out(&self.session_id, self.client_id, event).await
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ChannelSignal>, ChannelError> {
        Ok(self.hub.join(&self.session_id, self.client_id).await)
    }

    async fn unsubscribe(&self) {
        self.hub.part(&self.session_id, self.client_id).await;
    }
}

#[cfg(test)]
#[path = "hub_test.rs"]
mod hub_test;

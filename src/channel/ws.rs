//! WebSocket channel to the relay server.
//!
//! ARCHITECTURE
//! ============
//! `subscribe` spawns one connection task per channel. The task owns the
//! socket and loops: connect, forward frames both ways until the socket
//! drops, then wait out the backoff delay and reconnect. Status transitions
//! are reported to the subscriber as they happen.
//!
//! `publish` hands the encoded event to the task and waits for a oneshot
//! acknowledgment sent after the socket write completes. Publishing while the
//! socket is down fails fast with `Disconnected`; nothing is buffered for a
//! later connection.
//!
//! The task never blocks the socket on the subscriber. Inbound events that
//! find the signal queue full are dropped, and while a status transition
//! waits for queue space, outgoing frames are still answered.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{Backoff, Channel, ChannelError, ChannelSignal, ChannelStatus};
use crate::config::session_endpoint;
use crate::event::{ClientId, SyncEvent};

const STOP_GRACE: Duration = Duration::from_secs(1);

struct Outgoing {
    text: String,
    ack: oneshot::Sender<Result<(), ChannelError>>,
}

struct Connection {
    outgoing: mpsc::Sender<Outgoing>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Relay-backed channel. The URL is
/// `{ws_base}/sessions/{session_id}/ws?client_id={client_id}`, with the
/// session id percent-encoded as one path segment.
pub struct WsChannel {
    session_id: String,
    url: String,
    backoff: Backoff,
    capacity: usize,
    connected: Arc<AtomicBool>,
    connection: Mutex<Option<Connection>>,
}

impl WsChannel {
    pub fn new(ws_base: &str, session_id: impl Into<String>, client_id: ClientId, backoff: Backoff, capacity: usize) -> Self {
        let session_id = session_id.into();
        let url = match session_endpoint(ws_base, &session_id, &["ws"]) {
            Some(mut url) => {
                url.query_pairs_mut().clear().append_pair("client_id", &client_id.to_string());
                url.into()
            }
            // Left unparsed; the connect attempt reports it as `Errored`.
            None => format!("{ws_base}/sessions/{session_id}/ws?client_id={client_id}"),
        };
        Self {
            session_id,
            url,
            backoff,
            capacity: capacity.max(2),
            connected: Arc::new(AtomicBool::new(false)),
            connection: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn stop(&self) {
        let Some(connection) = self.connection.lock().await.take() else {
            return;
        };
        let _ = connection.shutdown.send(true);
        let mut task = connection.task;
        // A subscriber that stopped draining can leave the task parked on a
        // status delivery.
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            warn!(session_id = %self.session_id, "ws task did not stop in time; aborting");
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Channel for WsChannel {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn publish(&self, event: &SyncEvent) -> Result<(), ChannelError> {
        let text = event.encode()?;
        let outgoing = {
            let guard = self.connection.lock().await;
            let Some(connection) = guard.as_ref() else {
                return Err(ChannelError::Closed);
            };
            connection.outgoing.clone()
        };
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::Disconnected);
        }

        let (ack, ack_rx) = oneshot::channel();
        outgoing.send(Outgoing { text, ack }).await.map_err(|_| ChannelError::Closed)?;
        ack_rx.await.map_err(|_| ChannelError::Disconnected)?
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ChannelSignal>, ChannelError> {
        self.stop().await;

        let (signals, signals_rx) = mpsc::channel(self.capacity);
        let (outgoing, outgoing_rx) = mpsc::channel(self.capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(connection_loop(
            self.url.clone(),
            self.session_id.clone(),
            self.backoff.clone(),
            Arc::clone(&self.connected),
            signals,
            outgoing_rx,
            shutdown_rx,
        ));
        *self.connection.lock().await = Some(Connection { outgoing, shutdown, task });
        Ok(signals_rx)
    }

    async fn unsubscribe(&self) {
        self.stop().await;
    }
}

// =============================================================================
// CONNECTION TASK
// =============================================================================

enum Exit {
    Shutdown,
    Dropped(Option<String>),
}

async fn connection_loop(
    url: String,
    session_id: String,
    mut backoff: Backoff,
    connected: Arc<AtomicBool>,
    signals: mpsc::Sender<ChannelSignal>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        report_status(&signals, ChannelStatus::Connecting, &mut outgoing).await;

        let exit = match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                backoff.reset();
                connected.store(true, Ordering::SeqCst);
                info!(%session_id, "ws channel subscribed");
                report_status(&signals, ChannelStatus::Subscribed, &mut outgoing).await;
                let exit = run_socket(stream, &session_id, &signals, &mut outgoing, &mut shutdown).await;
                connected.store(false, Ordering::SeqCst);
                exit
            }
            Err(e) => Exit::Dropped(Some(e.to_string())),
        };

        match exit {
            Exit::Shutdown => {
                report_status(&signals, ChannelStatus::Closed, &mut outgoing).await;
                return;
            }
            Exit::Dropped(Some(reason)) => {
                warn!(%session_id, error = %reason, "ws channel dropped");
                report_status(&signals, ChannelStatus::Errored(reason), &mut outgoing).await;
            }
            Exit::Dropped(None) => {
                info!(%session_id, "ws channel closed by server");
                report_status(&signals, ChannelStatus::Closed, &mut outgoing).await;
            }
        }

        let delay = backoff.next_delay();
        debug!(%session_id, delay_ms = delay.as_millis(), "ws reconnect scheduled");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => break,
                _ = shutdown.changed() => {
                    report_status(&signals, ChannelStatus::Closed, &mut outgoing).await;
                    return;
                }
                Some(msg) = outgoing.recv() => {
                    let _ = msg.ack.send(Err(ChannelError::Disconnected));
                }
            }
        }
    }
}

/// Deliver a status transition without starving publishers.
///
/// Status signals are not dropped, so this waits for queue space, but it
/// keeps rejecting outgoing frames meanwhile: a subscriber that publishes
/// from its own signal loop must never wait on this task. A subscriber has
/// not seen `Subscribed` until this returns, so `Disconnected` is the answer
/// it expects.
async fn report_status(
    signals: &mpsc::Sender<ChannelSignal>,
    status: ChannelStatus,
    outgoing: &mut mpsc::Receiver<Outgoing>,
) {
    let send = signals.send(ChannelSignal::Status(status));
    tokio::pin!(send);
    loop {
        tokio::select! {
            biased;
            _ = &mut send => return,
            Some(msg) = outgoing.recv() => {
                let _ = msg.ack.send(Err(ChannelError::Disconnected));
            }
        }
    }
}

async fn run_socket<S>(
    stream: S,
    session_id: &str,
    signals: &mpsc::Sender<ChannelSignal>,
    outgoing: &mut mpsc::Receiver<Outgoing>,
    shutdown: &mut watch::Receiver<bool>,
) -> Exit
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return Exit::Shutdown;
            }
            msg = outgoing.recv() => {
                let Some(Outgoing { text, ack }) = msg else {
                    return Exit::Shutdown;
                };
                match write.send(Message::Text(text.into())).await {
                    Ok(()) => {
                        let _ = ack.send(Ok(()));
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        let _ = ack.send(Err(ChannelError::Transport(reason.clone())));
                        return Exit::Dropped(Some(reason));
                    }
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match SyncEvent::decode(text.as_str()) {
                    // At-most-once: a subscriber that falls behind loses
                    // events rather than stalling the socket.
                    Ok(event) => match signals.try_send(ChannelSignal::Event(event)) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(%session_id, "signal queue full; dropping inbound event");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return Exit::Shutdown,
                    },
                    Err(e) => warn!(%session_id, error = %e, "dropping undecodable ws frame"),
                },
                Some(Ok(Message::Close(_))) | None => return Exit::Dropped(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Exit::Dropped(Some(e.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_includes_session_and_client() {
        let client_id = ClientId::generate();
        let channel = WsChannel::new("ws://localhost:3000/", "s1", client_id, Backoff::default(), 16);
        assert_eq!(channel.url(), format!("ws://localhost:3000/sessions/s1/ws?client_id={client_id}"));
    }

    #[test]
    fn url_escapes_reserved_characters_in_session_id() {
        let client_id = ClientId::generate();
        let channel = WsChannel::new("wss://relay.example.com", "a/b?c#d", client_id, Backoff::default(), 16);
        assert_eq!(channel.url(), format!("wss://relay.example.com/sessions/a%2Fb%3Fc%23d/ws?client_id={client_id}"));
        assert_eq!(channel.session_id(), "a/b?c#d");
    }

    #[tokio::test]
    async fn publish_before_subscribe_is_closed() {
        let channel = WsChannel::new("ws://127.0.0.1:9", "s1", ClientId::generate(), Backoff::default(), 16);
        let event = SyncEvent::new(
            "s1",
            ClientId::generate(),
            crate::event::EventBody::StateRequest(crate::event::StateRequestPayload::default()),
        );
        assert!(matches!(channel.publish(&event).await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn unreachable_relay_reports_errored_then_stops_cleanly() {
        let backoff = Backoff::new(Duration::from_millis(5), Duration::from_millis(10));
        let channel = WsChannel::new("ws://127.0.0.1:9", "s1", ClientId::generate(), backoff, 16);
        let mut rx = channel.subscribe().await.unwrap();
        assert_eq!(rx.recv().await, Some(ChannelSignal::Status(ChannelStatus::Connecting)));
        assert!(matches!(rx.recv().await, Some(ChannelSignal::Status(ChannelStatus::Errored(_)))));

        let event = SyncEvent::new(
            "s1",
            ClientId::generate(),
            crate::event::EventBody::StateRequest(crate::event::StateRequestPayload::default()),
        );
        assert!(matches!(channel.publish(&event).await, Err(ChannelError::Disconnected)));

        channel.unsubscribe().await;
        let mut saw_closed = false;
        while let Some(signal) = rx.recv().await {
            if signal == ChannelSignal::Status(ChannelStatus::Closed) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
    }
}

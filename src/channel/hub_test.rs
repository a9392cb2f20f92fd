use super::*;
use crate::doc::{Card, Point};
use crate::event::EventBody;

fn card_event(session_id: &str, client_id: ClientId) -> SyncEvent {
    SyncEvent::new(session_id, client_id, EventBody::CardAdd(Card::new("c1", Point::new(10.0, 20.0), "Need: Safety")))
}

async fn expect_status(rx: &mut mpsc::Receiver<ChannelSignal>, status: ChannelStatus) {
    assert_eq!(rx.recv().await, Some(ChannelSignal::Status(status)));
}

#[tokio::test]
async fn subscribe_emits_connecting_then_subscribed() {
    let hub = LocalHub::new();
    let channel = hub.channel("s1", ClientId::generate());
    let mut rx = channel.subscribe().await.unwrap();
    expect_status(&mut rx, ChannelStatus::Connecting).await;
    expect_status(&mut rx, ChannelStatus::Subscribed).await;
    assert_eq!(hub.member_count("s1").await, 1);
}

#[tokio::test]
async fn publish_reaches_every_member_including_sender() {
    let hub = LocalHub::new();
    let a = hub.channel("s1", ClientId::generate());
    let b = hub.channel("s1", ClientId::generate());
    let mut rx_a = a.subscribe().await.unwrap();
    let mut rx_b = b.subscribe().await.unwrap();
    for rx in [&mut rx_a, &mut rx_b] {
        expect_status(rx, ChannelStatus::Connecting).await;
        expect_status(rx, ChannelStatus::Subscribed).await;
    }

    let event = card_event("s1", a.client_id());
    a.publish(&event).await.unwrap();

    assert_eq!(rx_a.recv().await, Some(ChannelSignal::Event(event.clone())));
    assert_eq!(rx_b.recv().await, Some(ChannelSignal::Event(event)));
}

#[tokio::test]
async fn sessions_are_isolated() {
    let hub = LocalHub::new();
    let a = hub.channel("s1", ClientId::generate());
    let other = hub.channel("s2", ClientId::generate());
    let _rx_a = a.subscribe().await.unwrap();
    let mut rx_other = other.subscribe().await.unwrap();
    expect_status(&mut rx_other, ChannelStatus::Connecting).await;
    expect_status(&mut rx_other, ChannelStatus::Subscribed).await;

    a.publish(&card_event("s1", a.client_id())).await.unwrap();
    assert!(rx_other.try_recv().is_err());
}

#[tokio::test]
async fn publish_without_subscription_fails() {
    let hub = LocalHub::new();
    let channel = hub.channel("s1", ClientId::generate());
    let err = channel.publish(&card_event("s1", channel.client_id())).await.unwrap_err();
    assert!(matches!(err, ChannelError::Closed));
}

#[tokio::test]
async fn disconnected_member_cannot_send_and_misses_events() {
    let hub = LocalHub::new();
    let a = hub.channel("s1", ClientId::generate());
    let b = hub.channel("s1", ClientId::generate());
    let _rx_a = a.subscribe().await.unwrap();
    let mut rx_b = b.subscribe().await.unwrap();
    expect_status(&mut rx_b, ChannelStatus::Connecting).await;
    expect_status(&mut rx_b, ChannelStatus::Subscribed).await;

    assert!(hub.disconnect("s1", b.client_id()).await);
    expect_status(&mut rx_b, ChannelStatus::Closed).await;

    let err = b.publish(&card_event("s1", b.client_id())).await.unwrap_err();
    assert!(matches!(err, ChannelError::Disconnected));

    a.publish(&card_event("s1", a.client_id())).await.unwrap();
    assert!(rx_b.try_recv().is_err(), "missed events are not replayed");

    assert!(hub.reconnect("s1", b.client_id()).await);
    expect_status(&mut rx_b, ChannelStatus::Connecting).await;
    expect_status(&mut rx_b, ChannelStatus::Subscribed).await;
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn unsubscribe_removes_member_and_closes() {
    let hub = LocalHub::new();
    let channel = hub.channel("s1", ClientId::generate());
    let mut rx = channel.subscribe().await.unwrap();
    channel.unsubscribe().await;
    channel.unsubscribe().await;

    expect_status(&mut rx, ChannelStatus::Connecting).await;
    expect_status(&mut rx, ChannelStatus::Subscribed).await;
    expect_status(&mut rx, ChannelStatus::Closed).await;
    assert_eq!(rx.recv().await, None);
    assert_eq!(hub.member_count("s1").await, 0);
}

#[tokio::test]
async fn unknown_member_disconnect_returns_false() {
    let hub = LocalHub::new();
    assert!(!hub.disconnect("s1", ClientId::generate()).await);
    assert!(!hub.reconnect("s1", ClientId::generate()).await);
}

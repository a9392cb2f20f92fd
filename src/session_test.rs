use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::channel::LocalHub;
use crate::doc::{Card, CardPatch, CanvasState, Point};
use crate::persistence::mock::RecordingSink;
use crate::persistence::{LocalSink, LocalStorage, MemoryStorage, SaveStatus, sink_for_session};
use crate::store::{DirtyReason, DirtyReasons, MutationOptions};

const SESSION: &str = "s1";

async fn join(hub: &LocalHub, session_id: &str, sink: Arc<dyn PersistenceSink>) -> Arc<SyncSession> {
    join_with(hub, session_id, sink, SessionOptions::default()).await
}

async fn join_with(
    hub: &LocalHub,
    session_id: &str,
    sink: Arc<dyn PersistenceSink>,
    options: SessionOptions,
) -> Arc<SyncSession> {
    let client_id = ClientId::generate();
    let channel = Arc::new(hub.channel(session_id, client_id));
    let session = SyncSession::open(session_id, client_id, channel, sink, options).await.unwrap();
    session.subscribe().await.unwrap();
    Arc::new(session)
}

/// Pump every session until no signals remain anywhere.
async fn settle(sessions: &[&Arc<SyncSession>]) {
    loop {
        let mut handled = 0;
        for session in sessions {
            handled += session.pump().await;
        }
        if handled == 0 {
            return;
        }
    }
}

fn safety_card() -> Card {
    Card::new("c1", Point::new(10.0, 20.0), "Need: Safety")
}

// =============================================================
// End-to-end scenarios
// =============================================================

#[tokio::test]
async fn new_card_reaches_peer_by_broadcast_and_flushes_at_version_one() {
    let hub = LocalHub::new();
    let sink_a = Arc::new(RecordingSink::queued());
    let sink_b = Arc::new(RecordingSink::queued());
    let a = join(&hub, SESSION, sink_a.clone()).await;
    let b = join(&hub, SESSION, sink_b.clone()).await;
    settle(&[&a, &b]).await;

    a.mutate(|store| store.add_card(safety_card(), MutationOptions::local())).await;
    assert!(a.store().read().await.dirty_reasons().contains(&DirtyReason::CardAdded));

    settle(&[&a, &b]).await;
    {
        let store_b = b.store().read().await;
        let card = &store_b.elements().cards["c1"];
        assert_eq!(card.title, "Need: Safety");
        assert_eq!(card.position, Point::new(10.0, 20.0));
        assert!(!store_b.can_undo());
    }
    assert_eq!(sink_b.write_count(), 0);

    assert_eq!(a.coordinator().autosave_tick().await.unwrap(), FlushOutcome::Queued { version: 1 });
    let write = &sink_a.writes()[0];
    assert_eq!(write.state.version, 1);
    assert_eq!(write.state.cards[0].title, "Need: Safety");
    assert_eq!(write.reasons, vec![DirtyReason::CardAdded]);
}

#[tokio::test]
async fn reconnect_requests_state_and_adopts_newer_snapshot() {
    let hub = LocalHub::new();
    let sink_a = Arc::new(RecordingSink::queued());
    let a = join(&hub, SESSION, sink_a.clone()).await;
    let b = join(&hub, SESSION, Arc::new(RecordingSink::queued())).await;
    settle(&[&a, &b]).await;

    a.mutate(|store| store.add_card(safety_card(), MutationOptions::local())).await;
    settle(&[&a, &b]).await;
    let _ = b.store().write().await.consume_dirty_reasons();

    assert!(hub.disconnect(SESSION, b.client_id()).await);
    for x in [30.0, 40.0] {
        b.mutate(|store| store.update_card(CardPatch::moved_to("c1", Point::new(x, x)), MutationOptions::local()))
            .await;
    }
    settle(&[&a, &b]).await;
    assert_eq!(a.store().read().await.elements().cards["c1"].position, Point::new(10.0, 20.0));

    a.coordinator().autosave_tick().await.unwrap();
    assert_eq!(a.store().read().await.last_saved_version(), 1);

    assert!(hub.reconnect(SESSION, b.client_id()).await);
    settle(&[&a, &b]).await;

    let store_b = b.store().read().await;
    assert_eq!(store_b.last_saved_version(), 1);
    assert_eq!(store_b.elements().cards["c1"].position, Point::new(10.0, 20.0));
    assert!(!store_b.can_undo(), "resync replaces history");
    assert_eq!(store_b.last_updated_at(), a.store().read().await.last_updated_at());
}

#[tokio::test]
async fn demo_session_saves_locally_without_network_write() {
    let hub = LocalHub::new();
    let durable = Arc::new(RecordingSink::queued());
    let storage = Arc::new(MemoryStorage::new());
    let local: Arc<dyn PersistenceSink> = Arc::new(LocalSink::new(storage.clone()));
    let sink = sink_for_session("demo-abc123", "demo-", durable.clone(), local);

    let session = join(&hub, "demo-abc123", sink).await;
    session.mutate(|store| store.add_card(safety_card(), MutationOptions::local())).await;
    let outcome = session.coordinator().autosave_tick().await.unwrap();
    assert!(matches!(outcome, FlushOutcome::Persisted { version: 1, .. }));

    assert_eq!(durable.write_count(), 0);
    let stored = storage.load_local("demo-abc123").await.unwrap();
    assert_eq!(stored, Some(session.store().read().await.snapshot()));
}

// =============================================================
// Echo, undo, load
// =============================================================

#[tokio::test]
async fn own_broadcast_is_not_reapplied() {
    let hub = LocalHub::new();
    let a = join(&hub, SESSION, Arc::new(RecordingSink::queued())).await;
    settle(&[&a]).await;

    a.mutate(|store| store.add_card(safety_card(), MutationOptions::local())).await;
    let before = a.store().read().await.snapshot();
    assert_eq!(a.pump().await, 1);
    let store = a.store().read().await;
    assert_eq!(store.snapshot(), before);
    assert!(store.can_undo());
}

#[tokio::test]
async fn undo_is_broadcast_as_manual_snapshot() {
    let hub = LocalHub::new();
    let a = join(&hub, SESSION, Arc::new(RecordingSink::queued())).await;
    let b = join(&hub, SESSION, Arc::new(RecordingSink::queued())).await;
    settle(&[&a, &b]).await;

    b.mutate(|store| store.add_card(Card::new("mine", Point::default(), "b"), MutationOptions::local())).await;
    a.mutate(|store| store.add_card(safety_card(), MutationOptions::local())).await;
    settle(&[&a, &b]).await;
    assert_eq!(b.store().read().await.elements().cards.len(), 2);

    assert!(a.mutate(MutationStore::undo).await);
    settle(&[&a, &b]).await;

    let store_b = b.store().read().await;
    assert!(!store_b.elements().cards.contains_key("c1"));
    assert!(store_b.can_undo(), "manual snapshot keeps local history");
}

#[tokio::test]
async fn open_seeds_watermark_from_stored_document() {
    let hub = LocalHub::new();
    let mut stored = CanvasState { version: 3, updated_at: Some("2026-04-04T00:00:00Z".into()), ..CanvasState::default() };
    stored.cards.push(safety_card());
    let sink = Arc::new(RecordingSink::queued().with_stored(stored));

    let session = join(&hub, SESSION, sink.clone()).await;
    {
        let store = session.store().read().await;
        assert_eq!(store.last_saved_version(), 3);
        assert_eq!(store.last_updated_at(), Some("2026-04-04T00:00:00Z"));
        assert_eq!(store.elements().cards.len(), 1);
        assert!(!store.is_dirty());
    }

    session.coordinator().flush(DirtyReasons::new(), true).await.unwrap();
    assert_eq!(sink.writes()[0].state.version, 4);
}

#[tokio::test]
async fn open_empty_session_starts_at_version_zero() {
    let hub = LocalHub::new();
    let session = join(&hub, SESSION, Arc::new(RecordingSink::queued())).await;
    let store = session.store().read().await;
    assert_eq!(store.last_saved_version(), 0);
    assert!(store.elements().is_empty());
}

// =============================================================
// Persistence failures
// =============================================================

#[tokio::test]
async fn write_outage_keeps_editing_and_recovers() {
    let hub = LocalHub::new();
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    let options = SessionOptions {
        on_error: Some(Arc::new(move |_: &PersistError| {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        ..SessionOptions::default()
    };
    let sink = Arc::new(RecordingSink::queued());
    let session = join_with(&hub, SESSION, sink.clone(), options).await;
    let status = session.coordinator().subscribe_status();

    sink.fail_next(1);
    session.mutate(|store| store.add_card(safety_card(), MutationOptions::local())).await;
    assert_eq!(*status.borrow(), SaveStatus::Dirty);
    assert!(session.coordinator().autosave_tick().await.is_err());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(*status.borrow(), SaveStatus::Dirty);

    session
        .mutate(|store| store.update_card(CardPatch::moved_to("c1", Point::new(1.0, 2.0)), MutationOptions::local()))
        .await;
    assert!(session.coordinator().autosave_tick().await.is_ok());
    assert_eq!(*status.borrow(), SaveStatus::Idle);

    let write = &sink.writes()[0];
    assert_eq!(write.reasons, vec![DirtyReason::CardAdded, DirtyReason::CardMoved]);
    assert_eq!(write.state.cards[0].position, Point::new(1.0, 2.0));
}

// =============================================================
// Lifecycle
// =============================================================

#[tokio::test(start_paused = true)]
async fn started_sessions_sync_and_autosave_in_background() {
    let hub = LocalHub::new();
    let sink_a = Arc::new(RecordingSink::queued());
    let a = join(&hub, SESSION, sink_a.clone()).await;
    let b = join(&hub, SESSION, Arc::new(RecordingSink::queued())).await;
    let handle_a = a.start().await.unwrap();
    let handle_b = b.start().await.unwrap();

    a.mutate(|store| store.add_card(safety_card(), MutationOptions::local())).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(b.store().read().await.elements().cards.contains_key("c1"));
    assert_eq!(sink_a.write_count(), 0);

    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(sink_a.write_count(), 1);

    handle_b.stop().await;
    assert!(b.coordinator().is_closed());
    assert_eq!(hub.member_count(SESSION).await, 1);

    a.mutate(|store| store.remove_card("c1", MutationOptions::local())).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(b.store().read().await.elements().cards.contains_key("c1"), "stopped session receives nothing");

    let outcome = handle_a.close().await.unwrap();
    assert_eq!(outcome, FlushOutcome::Queued { version: 2 });
    assert_eq!(hub.member_count(SESSION).await, 0);
}

#[tokio::test]
async fn close_forces_final_checkpoint_even_when_clean() {
    let hub = LocalHub::new();
    let sink = Arc::new(RecordingSink::queued());
    let session = join(&hub, SESSION, sink.clone()).await;

    assert_eq!(session.close().await.unwrap(), FlushOutcome::Queued { version: 1 });
    assert_eq!(sink.write_count(), 1);
    assert!(session.coordinator().is_closed());
    assert_eq!(hub.member_count(SESSION).await, 0);
    assert_eq!(session.pump().await, 0);
}

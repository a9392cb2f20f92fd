use super::*;

#[test]
fn session_room_new_is_empty() {
    assert!(SessionRoom::new().clients.is_empty());
    assert!(SessionRoom::default().clients.is_empty());
}

#[tokio::test]
async fn app_state_starts_without_rooms_or_queue() {
    let state = test_helpers::test_app_state();
    assert!(state.rooms.read().await.is_empty());
    assert!(state.checkpoint_tx.is_none());
}

#[tokio::test]
async fn with_checkpoint_queue_installs_sender() {
    let (tx, _rx) = mpsc::channel(1);
    let (state, _repo) = test_helpers::memory_app_state();
    let state = state.with_checkpoint_queue(tx);
    assert!(state.checkpoint_tx.is_some());
}

#[tokio::test]
async fn seeded_clients_share_a_room() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::seed_client(&state, "s1").await;
    let (b, _rx_b) = test_helpers::seed_client(&state, "s1").await;
    let rooms = state.rooms.read().await;
    let room = rooms.get("s1").unwrap();
    assert!(room.clients.contains_key(&a));
    assert!(room.clients.contains_key(&b));
}

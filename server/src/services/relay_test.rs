use sessionboard::event::{ClientId, EventBody, StateRequestPayload};

use super::*;
use crate::state::test_helpers;

fn request_text(session_id: &str) -> String {
    let body = EventBody::StateRequest(StateRequestPayload { since_version: Some(2) });
    SyncEvent::new(session_id, ClientId::generate(), body).encode().unwrap()
}

// =============================================================================
// Membership
// =============================================================================

#[tokio::test]
async fn join_and_part_track_membership() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::seed_client(&state, "s1").await;
    let (b, _rx_b) = test_helpers::seed_client(&state, "s1").await;
    assert_eq!(member_count(&state, "s1").await, 2);

    part(&state, "s1", a).await;
    assert_eq!(member_count(&state, "s1").await, 1);
    part(&state, "s1", b).await;
    assert_eq!(member_count(&state, "s1").await, 0);
    assert!(state.rooms.read().await.get("s1").is_none(), "empty room is dropped");
}

#[tokio::test]
async fn part_unknown_session_is_noop() {
    let state = test_helpers::test_app_state();
    part(&state, "missing", Uuid::new_v4()).await;
    assert!(state.rooms.read().await.is_empty());
}

// =============================================================================
// Fan-out
// =============================================================================

#[tokio::test]
async fn broadcast_excludes_sender() {
    let state = test_helpers::test_app_state();
    let (a, mut rx_a) = test_helpers::seed_client(&state, "s1").await;
    let (_b, mut rx_b) = test_helpers::seed_client(&state, "s1").await;
    let (_c, mut rx_c) = test_helpers::seed_client(&state, "s1").await;

    assert_eq!(broadcast(&state, "s1", "hello", Some(a)).await, 2);
    assert_eq!(rx_b.recv().await.as_deref(), Some("hello"));
    assert_eq!(rx_c.recv().await.as_deref(), Some("hello"));
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn broadcast_stays_within_session() {
    let state = test_helpers::test_app_state();
    let (_a, mut rx_a) = test_helpers::seed_client(&state, "s1").await;
    let (_b, mut rx_b) = test_helpers::seed_client(&state, "s2").await;

    assert_eq!(broadcast(&state, "s1", "only-s1", None).await, 1);
    assert_eq!(rx_a.recv().await.as_deref(), Some("only-s1"));
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn full_member_queue_drops_frame() {
    let state = test_helpers::test_app_state();
    let (tx, mut rx) = mpsc::channel(1);
    join(&state, "s1", Uuid::new_v4(), tx).await;

    assert_eq!(broadcast(&state, "s1", "first", None).await, 1);
    assert_eq!(broadcast(&state, "s1", "second", None).await, 0);
    assert_eq!(rx.recv().await.as_deref(), Some("first"));
    assert!(rx.try_recv().is_err());
}

// =============================================================================
// Frame validation
// =============================================================================

#[test]
fn accept_frame_returns_event_for_matching_session() {
    let event = accept_frame("s1", &request_text("s1")).unwrap();
    assert_eq!(event.session_id, "s1");
}

#[test]
fn accept_frame_rejects_other_session() {
    let err = accept_frame("s1", &request_text("s2")).unwrap_err();
    assert_eq!(err.error_code(), "E_SESSION_MISMATCH");
}

#[test]
fn accept_frame_rejects_garbage() {
    let err = accept_frame("s1", "not json").unwrap_err();
    assert!(matches!(err, RelayError::Decode(_)));
}

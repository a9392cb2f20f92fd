use serde_json::json;

use super::*;
use crate::state::test_helpers;

fn request(name: &str, preview: Option<&[u8]>) -> CheckpointRequest {
    CheckpointRequest {
        name: name.into(),
        data: json!({ "cards": [{ "id": "c1", "position": { "x": 10.0, "y": 20.0 }, "title": "Need: Safety" }] }),
        preview_png: preview.map(|bytes| BASE64.encode(bytes)),
    }
}

// =============================================================================
// Preview decoding
// =============================================================================

#[test]
fn decode_preview_absent_or_empty_is_none() {
    assert!(decode_preview(None, 10).unwrap().is_none());
    assert!(decode_preview(Some(""), 10).unwrap().is_none());
}

#[test]
fn decode_preview_within_cap() {
    let encoded = BASE64.encode([1u8, 2, 3, 4]);
    assert_eq!(decode_preview(Some(&encoded), 4).unwrap(), Some(vec![1, 2, 3, 4]));
}

#[test]
fn decode_preview_over_cap() {
    let encoded = BASE64.encode([0u8; 64]);
    let err = decode_preview(Some(&encoded), 16).unwrap_err();
    assert!(matches!(err, CheckpointError::PreviewTooLarge { max: 16, .. }));
    assert_eq!(err.error_code(), "E_CHECKPOINT_PREVIEW_TOO_LARGE");
}

#[test]
fn decode_preview_rejects_invalid_base64() {
    let err = decode_preview(Some("@@@@"), 1024).unwrap_err();
    assert_eq!(err.error_code(), "E_CHECKPOINT_PREVIEW");
}

// =============================================================================
// Create / list
// =============================================================================

#[tokio::test]
async fn create_then_list_newest_first() {
    let (state, _repo) = test_helpers::memory_app_state();
    let first = create_checkpoint(&state, "s1", request("Before break", None)).await.unwrap();
    let second = create_checkpoint(&state, "s1", request("  End of session ", Some(&[137, 80, 78, 71])))
        .await
        .unwrap();
    assert_eq!(second.name, "End of session");
    assert!(second.has_preview);
    assert!(!first.has_preview);

    let listed = list_checkpoints(&state, "s1").await.unwrap();
    assert_eq!(listed.iter().map(|c| c.id).collect::<Vec<_>>(), vec![second.id, first.id]);
    assert!(list_checkpoints(&state, "other").await.unwrap().is_empty());
}

#[tokio::test]
async fn count_cap_is_enforced_per_session() {
    let (mut state, _repo) = test_helpers::memory_app_state();
    state.limits.max_per_session = 2;
    create_checkpoint(&state, "s1", request("one", None)).await.unwrap();
    create_checkpoint(&state, "s1", request("two", None)).await.unwrap();

    let err = create_checkpoint(&state, "s1", request("three", None)).await.unwrap_err();
    assert!(matches!(err, CheckpointError::LimitReached { max: 2 }));
    assert!(!err.retryable());
    create_checkpoint(&state, "s2", request("elsewhere", None)).await.unwrap();
}

#[tokio::test]
async fn invalid_requests_write_nothing() {
    let (state, _repo) = test_helpers::memory_app_state();
    assert!(matches!(
        create_checkpoint(&state, "s1", request("   ", None)).await,
        Err(CheckpointError::EmptyName)
    ));
    assert!(matches!(
        create_checkpoint(&state, "s1", request(&"x".repeat(201), None)).await,
        Err(CheckpointError::NameTooLong)
    ));
    let not_a_document = CheckpointRequest { data: json!([1, 2]), ..request("bad", None) };
    assert!(matches!(
        create_checkpoint(&state, "s1", not_a_document).await,
        Err(CheckpointError::InvalidDocument)
    ));
    assert!(list_checkpoints(&state, "s1").await.unwrap().is_empty());
}

#[test]
fn limits_default_to_twenty_and_two_mebibytes() {
    let limits = CheckpointLimits::default();
    assert_eq!(limits.max_per_session, 20);
    assert_eq!(limits.max_preview_bytes, 2 * 1024 * 1024);
}

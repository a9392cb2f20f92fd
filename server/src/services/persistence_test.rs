use serde_json::json;

use super::*;
use crate::state::test_helpers::MemoryRepository;

fn message(session_id: &str, version: i64) -> CheckpointMessage {
    CheckpointMessage {
        session_id: session_id.into(),
        checkpoint_data: json!({ "cards": [], "version": version }),
        user_id: Some("therapist-1".into()),
    }
}

fn fast_config(retries: usize) -> CheckpointQueueConfig {
    CheckpointQueueConfig { queue_capacity: 4, retries, retry_base_ms: 10 }
}

// =============================================================================
// env_parse
// =============================================================================

#[test]
fn env_parse_missing_returns_default() {
    let val: usize = env_parse("__TEST_NONEXISTENT_KEY_12345__", 42);
    assert_eq!(val, 42);
}

#[test]
fn env_parse_present_valid() {
    unsafe { std::env::set_var("__TEST_CP_VALID__", "99") };
    let val: usize = env_parse("__TEST_CP_VALID__", 0);
    assert_eq!(val, 99);
    unsafe { std::env::remove_var("__TEST_CP_VALID__") };
}

#[test]
fn env_parse_present_invalid_returns_default() {
    unsafe { std::env::set_var("__TEST_CP_INVALID__", "notanumber") };
    let val: usize = env_parse("__TEST_CP_INVALID__", 7);
    assert_eq!(val, 7);
    unsafe { std::env::remove_var("__TEST_CP_INVALID__") };
}

#[test]
fn checkpoint_queue_config_defaults_match_constants() {
    unsafe {
        std::env::remove_var("CHECKPOINT_QUEUE_CAPACITY");
        std::env::remove_var("CHECKPOINT_QUEUE_RETRIES");
        std::env::remove_var("CHECKPOINT_QUEUE_RETRY_BASE_MS");
    }
    let config = CheckpointQueueConfig::from_env();
    assert_eq!(config.queue_capacity, DEFAULT_CHECKPOINT_QUEUE_CAPACITY);
    assert_eq!(config.retries, DEFAULT_CHECKPOINT_QUEUE_RETRIES);
    assert_eq!(config.retry_base_ms, DEFAULT_CHECKPOINT_QUEUE_RETRY_BASE_MS);
}

// =============================================================================
// Message
// =============================================================================

#[test]
fn message_version_reads_document_version() {
    assert_eq!(message("s1", 7).version(), 7);
    let untagged = CheckpointMessage { checkpoint_data: json!({}), ..message("s1", 0) };
    assert_eq!(untagged.version(), 0);
}

#[test]
fn message_wire_shape_uses_snake_case_fields() {
    let value = serde_json::to_value(message("s1", 1)).unwrap();
    assert_eq!(value["session_id"], "s1");
    assert_eq!(value["checkpoint_data"]["version"], 1);
    assert_eq!(value["user_id"], "therapist-1");
}

// =============================================================================
// Enqueue
// =============================================================================

#[tokio::test]
async fn enqueue_reports_full_and_closed() {
    let (tx, rx) = mpsc::channel(1);
    assert_eq!(enqueue_checkpoint(&tx, message("s1", 1)), Ok(()));
    assert_eq!(enqueue_checkpoint(&tx, message("s1", 2)), Err(EnqueueRejected::Full));
    drop(rx);
    assert_eq!(enqueue_checkpoint(&tx, message("s1", 3)), Err(EnqueueRejected::Closed));
}

// =============================================================================
// Retry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn persist_retries_transient_failures() {
    let repo = MemoryRepository::default();
    repo.fail_next_saves(2);
    assert!(persist_with_retry(&repo, &message("s1", 4), fast_config(3)).await);
    assert_eq!(repo.save_calls(), 3);
    assert_eq!(repo.stored("s1").unwrap().version, 4);
}

#[tokio::test(start_paused = true)]
async fn persist_gives_up_after_retries() {
    let repo = MemoryRepository::default();
    repo.fail_next_saves(5);
    assert!(!persist_with_retry(&repo, &message("s1", 1), fast_config(2)).await);
    assert_eq!(repo.save_calls(), 2);
    assert!(repo.stored("s1").is_none());
}

#[tokio::test]
async fn older_checkpoint_never_lowers_stored_version() {
    let repo = MemoryRepository::default();
    assert!(persist_with_retry(&repo, &message("s1", 5), fast_config(1)).await);
    assert!(persist_with_retry(&repo, &message("s1", 3), fast_config(1)).await);
    assert_eq!(repo.stored("s1").unwrap().version, 5);
}

// =============================================================================
// Worker
// =============================================================================

#[tokio::test]
async fn worker_drains_queue_into_repository() {
    let repo = Arc::new(MemoryRepository::default());
    let tx = spawn_checkpoint_worker(repo.clone(), fast_config(1));
    enqueue_checkpoint(&tx, message("s1", 1)).unwrap();
    enqueue_checkpoint(&tx, message("s2", 2)).unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while repo.stored("s1").is_none() || repo.stored("s2").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker should persist both checkpoints");
    assert_eq!(repo.stored("s2").unwrap().version, 2);
}

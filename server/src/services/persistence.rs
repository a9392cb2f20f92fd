//! Checkpoint persistence: the asynchronous queue behind `PUT /sessions/{id}`.
//!
//! DESIGN
//! ======
//! The write route enqueues a `CheckpointMessage` with `try_send` and answers
//! 202 immediately; a single worker drains the bounded queue and writes each
//! document through the repository. Processing is at-least-once from the
//! worker's point of view: a failed write is retried with linear backoff.
//!
//! ERROR HANDLING
//! ==============
//! After the last retry the message is dropped and logged at `error`. The
//! client has already advanced its watermark on 202, but its next autosave
//! carries the full document again, so a dropped checkpoint is superseded
//! rather than lost.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, info, warn};

use crate::db::Repository;

const DEFAULT_CHECKPOINT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_CHECKPOINT_QUEUE_RETRIES: usize = 3;
const DEFAULT_CHECKPOINT_QUEUE_RETRY_BASE_MS: u64 = 50;

/// Tuning knobs for the checkpoint worker, loaded from environment variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CheckpointQueueConfig {
    /// Bounded channel capacity for the checkpoint queue.
    pub(crate) queue_capacity: usize,
    /// Write attempts per message, including the first.
    pub(crate) retries: usize,
    /// Delay unit for linear retry back-off, in milliseconds.
    pub(crate) retry_base_ms: u64,
}

impl CheckpointQueueConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            queue_capacity: env_parse("CHECKPOINT_QUEUE_CAPACITY", DEFAULT_CHECKPOINT_QUEUE_CAPACITY).max(1),
            retries: env_parse("CHECKPOINT_QUEUE_RETRIES", DEFAULT_CHECKPOINT_QUEUE_RETRIES).max(1),
            retry_base_ms: env_parse("CHECKPOINT_QUEUE_RETRY_BASE_MS", DEFAULT_CHECKPOINT_QUEUE_RETRY_BASE_MS),
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// One queued document write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMessage {
    pub session_id: String,
    pub checkpoint_data: Value,
    pub user_id: Option<String>,
}

impl CheckpointMessage {
    /// The document version carried inside the checkpoint.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.checkpoint_data.get("version").and_then(Value::as_i64).unwrap_or(0)
    }
}

/// Why a message could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueRejected {
    Full,
    Closed,
}

/// Spawn the checkpoint worker and return its queue sender.
#[must_use]
pub fn spawn_checkpoint_worker(repo: Arc<dyn Repository>, config: CheckpointQueueConfig) -> mpsc::Sender<CheckpointMessage> {
    let (tx, mut rx) = mpsc::channel::<CheckpointMessage>(config.queue_capacity);

    info!(
        queue_capacity = config.queue_capacity,
        retries = config.retries,
        retry_base_ms = config.retry_base_ms,
        "checkpoint worker configured"
    );

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            persist_with_retry(repo.as_ref(), &message, config).await;
        }
        info!("checkpoint worker stopped");
    });

    tx
}

/// Non-blocking enqueue. The caller falls back to a synchronous write on
/// rejection.
pub fn enqueue_checkpoint(tx: &mpsc::Sender<CheckpointMessage>, message: CheckpointMessage) -> Result<(), EnqueueRejected> {
    match tx.try_send(message) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(message)) => {
            warn!(session_id = %message.session_id, "checkpoint queue full");
            Err(EnqueueRejected::Full)
        }
        Err(TrySendError::Closed(message)) => {
            warn!(session_id = %message.session_id, "checkpoint queue closed");
            Err(EnqueueRejected::Closed)
        }
    }
}

/// Write one message, retrying failures. Returns whether it was written.
pub(crate) async fn persist_with_retry(repo: &dyn Repository, message: &CheckpointMessage, config: CheckpointQueueConfig) -> bool {
    let version = message.version();
    let attempts = config.retries.max(1);
    for attempt in 1..=attempts {
        match repo
            .save_session(&message.session_id, &message.checkpoint_data, version, message.user_id.as_deref())
            .await
        {
            Ok(outcome) => {
                if outcome.applied {
                    info!(session_id = %message.session_id, version, "checkpoint persisted");
                } else {
                    info!(
                        session_id = %message.session_id,
                        version,
                        stored_version = outcome.version,
                        "checkpoint older than stored document; skipped"
                    );
                }
                return true;
            }
            Err(e) if attempt < attempts => {
                warn!(
                    session_id = %message.session_id,
                    error = %e,
                    attempt,
                    total = attempts,
                    "checkpoint persist failed; retrying"
                );
                tokio::time::sleep(Duration::from_millis((attempt as u64) * config.retry_base_ms)).await;
            }
            Err(e) => {
                error!(
                    session_id = %message.session_id,
                    error = %e,
                    version,
                    "checkpoint persist failed after retries; dropping"
                );
            }
        }
    }
    false
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;

//! In-memory sink for tests: records every write and can be told to fail.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{PersistError, PersistenceSink, WriteAck};
use crate::doc::CanvasState;
use crate::store::DirtyReason;

#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub session_id: String,
    pub state: CanvasState,
    pub reasons: Vec<DirtyReason>,
}

pub struct RecordingSink {
    ack: WriteAck,
    stored: Mutex<Option<CanvasState>>,
    writes: Mutex<Vec<RecordedWrite>>,
    failures: AtomicUsize,
}

impl RecordingSink {
    pub fn queued() -> Self {
        Self::with_ack(WriteAck::Queued)
    }

    pub fn persisted(updated_at: Option<&str>) -> Self {
        Self::with_ack(WriteAck::Persisted { updated_at: updated_at.map(str::to_owned) })
    }

    fn with_ack(ack: WriteAck) -> Self {
        Self { ack, stored: Mutex::new(None), writes: Mutex::new(Vec::new()), failures: AtomicUsize::new(0) }
    }

    /// Seed the document returned by `load`.
    pub fn with_stored(self, state: CanvasState) -> Self {
        *self.stored.lock().unwrap() = Some(state);
        self
    }

    /// Fail the next `count` writes.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

#[async_trait]
impl PersistenceSink for RecordingSink {
    async fn write(&self, session_id: &str, state: &CanvasState, reasons: &[DirtyReason]) -> Result<WriteAck, PersistError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PersistError::Unavailable("simulated outage".into()));
        }
        self.writes.lock().unwrap().push(RecordedWrite {
            session_id: session_id.to_owned(),
            state: state.clone(),
            reasons: reasons.to_vec(),
        });
        *self.stored.lock().unwrap() = Some(state.clone());
        Ok(self.ack.clone())
    }

    async fn load(&self, _session_id: &str) -> Result<Option<CanvasState>, PersistError> {
        Ok(self.stored.lock().unwrap().clone())
    }
}

//! Live view of a run's cursor and per-batch results.
//!
//! The tracker lives for a single invocation and is never persisted. A caller
//! that wants to survive a restart records [`ProgressTracker::resume_offset`]
//! and passes it back as `batch_start`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

/// Lifecycle of the tracked run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Running,
    Completed,
    Failed,
}

/// One committed (or simulated) batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchRecord {
    pub index: u64,
    /// First selection offset covered by the batch.
    pub start: u64,
    /// One past the last selection offset covered by the batch.
    pub end: u64,
    pub affected: u64,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

/// Point-in-time copy of the tracker state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub phase: RunPhase,
    pub run_id: String,
    /// Next unprocessed offset.
    pub cursor: u64,
    pub batch_start: u64,
    pub selection_len: u64,
    pub total_affected: u64,
    pub batches: Vec<BatchRecord>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            phase: RunPhase::Idle,
            run_id: String::new(),
            cursor: 0,
            batch_start: 0,
            selection_len: 0,
            total_affected: 0,
            batches: Vec::new(),
        }
    }
}

impl ProgressSnapshot {
    /// Rows of the selection not yet processed.
    pub fn remaining(&self) -> u64 {
        self.selection_len.saturating_sub(self.cursor)
    }
}

/// Cloneable handle shared between the executor and observers.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    tx: Arc<watch::Sender<ProgressSnapshot>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Receives every state change for the remainder of the run.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    /// Current cursor into the selection.
    pub fn cursor(&self) -> u64 {
        self.tx.borrow().cursor
    }

    /// Offset to pass as `batch_start` to continue after the last committed batch.
    pub fn resume_offset(&self) -> u64 {
        self.cursor()
    }

    pub fn total_affected(&self) -> u64 {
        self.tx.borrow().total_affected
    }

    pub(crate) fn begin(&self, run_id: &str, batch_start: u64, selection_len: u64) {
        self.tx.send_modify(|state| {
            *state = ProgressSnapshot {
                phase: RunPhase::Running,
                run_id: run_id.to_string(),
                cursor: batch_start,
                batch_start,
                selection_len,
                total_affected: 0,
                batches: Vec::new(),
            };
        });
    }

    pub(crate) fn record_batch(&self, record: BatchRecord) {
        self.tx.send_modify(|state| {
            state.cursor = record.end;
            state.total_affected = state.total_affected.saturating_add(record.affected);
            state.batches.push(record);
        });
    }

    pub(crate) fn finish(&self) {
        self.tx.send_modify(|state| state.phase = RunPhase::Completed);
    }

    pub(crate) fn fail(&self) {
        self.tx.send_modify(|state| state.phase = RunPhase::Failed);
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }
}

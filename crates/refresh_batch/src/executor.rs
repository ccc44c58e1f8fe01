//! Sequential batch loop over a frozen selection.
//!
//! Each batch reads the next `batch_size` identifiers at the cursor and
//! rewrites exactly those rows as its own committed unit of work. The cursor
//! moves by the number of identifiers *read*, so rows deleted after planning
//! shrink the affected count without shifting later batches. A failed batch
//! never moves the cursor; everything before it stays committed. A selection
//! that runs out before its planned length is a store failure at that cursor.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MutationError, MutationResult, StoreError};
use crate::planner::SelectionSet;
use crate::progress::{BatchRecord, ProgressTracker};
use crate::spec::{ExecutionMode, MutationSpec};
use crate::store::RowStore;

pub struct ChunkExecutor {
    store: Arc<dyn RowStore>,
    progress: ProgressTracker,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

/// Why a batch did not complete within its budget.
#[derive(Debug, Clone, Copy)]
enum BudgetKind {
    PerBatch,
    Overall,
}

impl ChunkExecutor {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self {
            store,
            progress: ProgressTracker::new(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Reports into a caller-owned tracker instead of a private one.
    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    /// Stops the run at the next batch boundary once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Overall deadline already running for the caller. Without one the
    /// mutation's own timeout starts when `run` is called.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Processes `selection[start..]` and returns the total (real or simulated)
    /// affected-row count. `start` at or past the end is a no-op.
    pub async fn run(
        &self,
        spec: &MutationSpec,
        selection: &SelectionSet,
        start: u64,
    ) -> MutationResult<u64> {
        self.progress.begin(spec.run_id(), start, selection.len());
        match self.run_batches(spec, selection, start).await {
            Ok(total) => {
                self.progress.finish();
                Ok(total)
            }
            Err(err) => {
                self.progress.fail();
                warn!(
                    run_id = spec.run_id(),
                    resume_from = ?err.resume_offset(),
                    error = %err,
                    "batched update stopped"
                );
                Err(err)
            }
        }
    }

    async fn run_batches(
        &self,
        spec: &MutationSpec,
        selection: &SelectionSet,
        start: u64,
    ) -> MutationResult<u64> {
        let started = Instant::now();
        let deadline = self
            .deadline
            .or_else(|| spec.timeout().map(|timeout| started + timeout));
        let mode = spec.mode();
        let mut cursor = start;
        let mut batch_index = 0u64;
        let mut total = 0u64;

        if start >= selection.len() {
            info!(
                run_id = spec.run_id(),
                batch_start = start,
                rows = selection.len(),
                "batch_start is past the end of the selection; nothing to do"
            );
        }

        while cursor < selection.len() {
            if self.cancel.is_cancelled() {
                return Err(MutationError::Cancelled { cursor });
            }

            let (budget, kind) = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(MutationError::OperationTimeout {
                            cursor,
                            timeout: spec.timeout().unwrap_or_default(),
                        });
                    }
                    if remaining < spec.per_batch_timeout() {
                        (remaining, BudgetKind::Overall)
                    } else {
                        (spec.per_batch_timeout(), BudgetKind::PerBatch)
                    }
                }
                None => (spec.per_batch_timeout(), BudgetKind::PerBatch),
            };

            let end_hint = cursor.saturating_add(spec.batch_size()).min(selection.len());
            let batch_started = Instant::now();
            let (read, affected) = match self
                .run_one_batch(spec, selection, cursor, mode, budget)
                .await
            {
                Ok(counts) => counts,
                Err(StoreError::Timeout) => {
                    return Err(timeout_error(spec, kind, batch_index, cursor, end_hint, budget));
                }
                Err(source) => return Err(MutationError::Store { cursor, source }),
            };
            if read == 0 {
                return Err(MutationError::Store {
                    cursor,
                    source: StoreError::SelectionTruncated {
                        selection: selection.name().to_string(),
                        expected: selection.len(),
                        found: cursor,
                    },
                });
            }

            let end = cursor + read;
            total = total.saturating_add(affected);
            self.progress.record_batch(BatchRecord {
                index: batch_index,
                start: cursor,
                end,
                affected,
                elapsed: batch_started.elapsed(),
            });
            info!(
                run_id = spec.run_id(),
                batch = batch_index,
                start = cursor,
                end,
                affected,
                total,
                mode = mode.as_str(),
                "batch committed"
            );
            cursor = end;
            batch_index += 1;
        }

        debug!(
            run_id = spec.run_id(),
            batches = batch_index,
            total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "selection exhausted"
        );
        Ok(total)
    }

    /// Returns `(identifiers read, rows affected)` for the batch at `cursor`.
    ///
    /// The read is abandoned client-side when `budget` runs out. The write is
    /// not: the store enforces the rest of the budget itself, so a batch whose
    /// commit was already issued is never reported as timed out.
    async fn run_one_batch(
        &self,
        spec: &MutationSpec,
        selection: &SelectionSet,
        cursor: u64,
        mode: ExecutionMode,
        budget: Duration,
    ) -> Result<(u64, u64), StoreError> {
        let batch_deadline = Instant::now() + budget;
        let ids = tokio::time::timeout_at(
            batch_deadline,
            self.store
                .read_selection(selection.name(), cursor, spec.batch_size()),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        let read = ids.len() as u64;
        if read == 0 {
            return Ok((0, 0));
        }
        let affected = match mode {
            ExecutionMode::Simulate => read,
            ExecutionMode::Apply => {
                let remaining = batch_deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(StoreError::Timeout);
                }
                self.store
                    .apply_update(spec.table(), spec.set_clause(), &ids, remaining)
                    .await?
            }
        };
        Ok((read, affected))
    }
}

fn timeout_error(
    spec: &MutationSpec,
    kind: BudgetKind,
    batch_index: u64,
    cursor: u64,
    end: u64,
    budget: Duration,
) -> MutationError {
    match kind {
        BudgetKind::PerBatch => MutationError::BatchTimeout {
            batch_index,
            cursor,
            end,
            timeout: budget,
        },
        BudgetKind::Overall => MutationError::OperationTimeout {
            cursor,
            timeout: spec.timeout().unwrap_or(budget),
        },
    }
}

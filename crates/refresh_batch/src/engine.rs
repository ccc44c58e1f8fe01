//! End-to-end batched update: plan (or re-attach), execute, verify, clean up.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::error::{MutationError, MutationResult};
use crate::executor::ChunkExecutor;
use crate::planner::{expected_update_count, BatchPlanner, SelectionSet};
use crate::progress::ProgressTracker;
use crate::spec::{ExecutionMode, MutationRequest, MutationSpec};
use crate::store::RowStore;
use crate::verify::{VerificationGate, Verdict};

/// Result returned to the caller of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationOutcome {
    pub run_id: String,
    pub mode: ExecutionMode,
    pub total_rows_updated: u64,
    pub expected_row_count: u64,
    pub batches: u64,
    pub final_cursor: u64,
    pub verdict: Verdict,
    /// False when the selection artifact could not be dropped and needs manual cleanup.
    pub selection_released: bool,
}

pub struct BatchedMutation {
    store: Arc<dyn RowStore>,
    progress: ProgressTracker,
}

impl BatchedMutation {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self {
            store,
            progress: ProgressTracker::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Validates `request` and runs it to completion.
    pub async fn execute(
        &self,
        request: MutationRequest,
        cancel: CancellationToken,
    ) -> MutationResult<MutationOutcome> {
        let spec = MutationSpec::try_from(request)?;
        self.execute_spec(&spec, cancel).await
    }

    pub async fn execute_spec(
        &self,
        spec: &MutationSpec,
        cancel: CancellationToken,
    ) -> MutationResult<MutationOutcome> {
        let span = info_span!(
            "batched_update",
            run_id = spec.run_id(),
            table = spec.table(),
            mode = spec.mode().as_str()
        );
        self.execute_inner(spec, cancel).instrument(span).await
    }

    async fn execute_inner(
        &self,
        spec: &MutationSpec,
        cancel: CancellationToken,
    ) -> MutationResult<MutationOutcome> {
        // The overall budget also covers planning and the final drop.
        let deadline = spec.timeout().map(|timeout| Instant::now() + timeout);
        let planner = BatchPlanner::new(self.store.clone());
        let selection = within(deadline, spec, async {
            if spec.resume() {
                planner.attach(spec).await
            } else {
                planner.plan(spec).await
            }
        })
        .await?;

        let derived = expected_update_count(&selection, Some(spec.batch_start()));
        let expected = spec.expected_row_count().unwrap_or(derived);
        info!(
            rows = selection.len(),
            batch_start = spec.batch_start(),
            batch_size = spec.batch_size(),
            expected,
            "starting batched update"
        );

        let executor = ChunkExecutor::new(self.store.clone())
            .with_progress(self.progress.clone())
            .with_cancellation(cancel)
            .with_deadline(deadline);
        // On failure the selection is kept so `resume` can continue from the cursor.
        let total = executor.run(spec, &selection, spec.batch_start()).await?;

        let verdict = VerificationGate::verify(expected, total, spec.mode());
        let selection_released = release(&planner, &selection, deadline).await;
        let verdict = verdict?;

        let snapshot = self.progress.snapshot();
        info!(
            total_rows_updated = total,
            batches = snapshot.batches.len(),
            "batched update finished"
        );
        Ok(MutationOutcome {
            run_id: spec.run_id().to_string(),
            mode: spec.mode(),
            total_rows_updated: total,
            expected_row_count: expected,
            batches: snapshot.batches.len() as u64,
            final_cursor: snapshot.cursor,
            verdict,
            selection_released,
        })
    }
}

/// Runs a pre-batch step against the overall deadline. Nothing has been
/// written yet, so a timeout resumes from the requested `batch_start`.
async fn within<T>(
    deadline: Option<Instant>,
    spec: &MutationSpec,
    step: impl Future<Output = MutationResult<T>>,
) -> MutationResult<T> {
    let Some(deadline) = deadline else {
        return step.await;
    };
    match tokio::time::timeout_at(deadline, step).await {
        Ok(result) => result,
        Err(_) => {
            let err = MutationError::OperationTimeout {
                cursor: spec.batch_start(),
                timeout: spec.timeout().unwrap_or_default(),
            };
            warn!(run_id = spec.run_id(), error = %err, "planning did not finish in time");
            Err(err)
        }
    }
}

async fn release(
    planner: &BatchPlanner,
    selection: &SelectionSet,
    deadline: Option<Instant>,
) -> bool {
    let dropped = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, planner.release(selection))
            .await
            .unwrap_or_else(|_| {
                Err(anyhow::anyhow!("dropping the selection ran past the overall timeout").into())
            }),
        None => planner.release(selection).await,
    };
    match dropped {
        Ok(()) => true,
        Err(err) => {
            warn!(
                selection = selection.name(),
                error = %err,
                "failed to drop selection; drop it manually"
            );
            false
        }
    }
}

impl MutationOutcome {
    /// Whether verification passed without tolerance.
    pub fn is_exact(&self) -> bool {
        matches!(self.verdict, Verdict::Match)
    }
}

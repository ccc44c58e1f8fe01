//! Error types for planning, executing, and verifying batched updates.
//!
//! Every variant raised after the first batch has started carries the cursor
//! to hand back as `batch_start` on the next invocation.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the batch engine.
pub type MutationResult<T> = Result<T, MutationError>;

/// Failures surfaced by a batched mutation invocation.
#[derive(Debug, Error)]
pub enum MutationError {
    /// The request could not be turned into a valid [`crate::MutationSpec`].
    #[error("invalid mutation request: {0}")]
    InvalidSpec(String),

    /// The selection could not be materialized (or re-attached).
    #[error("planning failed for table `{table}`: {reason}")]
    Planning { table: String, reason: String },

    /// One batch did not finish inside its per-batch budget.
    #[error(
        "batch {batch_index} (rows {cursor}..{end}) exceeded {timeout:?}; resume with batch_start={cursor}"
    )]
    BatchTimeout {
        batch_index: u64,
        cursor: u64,
        end: u64,
        timeout: Duration,
    },

    /// The overall operation budget ran out.
    #[error("mutation exceeded overall timeout {timeout:?}; resume with batch_start={cursor}")]
    OperationTimeout { cursor: u64, timeout: Duration },

    /// The caller cancelled the run between batches.
    #[error("mutation cancelled; resume with batch_start={cursor}")]
    Cancelled { cursor: u64 },

    /// A real run updated a different number of rows than expected.
    #[error("expected {expected} updated rows but {actual} were updated")]
    RowCountMismatch { expected: u64, actual: u64 },

    /// The backing store failed outside of planning.
    #[error("store failure at cursor {cursor}: {source}")]
    Store {
        cursor: u64,
        #[source]
        source: StoreError,
    },
}

impl MutationError {
    /// Offset a caller should pass as `batch_start` to continue, when the
    /// failure left committed progress behind.
    pub fn resume_offset(&self) -> Option<u64> {
        match self {
            Self::BatchTimeout { cursor, .. }
            | Self::OperationTimeout { cursor, .. }
            | Self::Cancelled { cursor }
            | Self::Store { cursor, .. } => Some(*cursor),
            Self::InvalidSpec(_) | Self::Planning { .. } | Self::RowCountMismatch { .. } => None,
        }
    }
}

/// Failures reported by a [`crate::RowStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The predicate or set clause was rejected by the backend.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("unknown table `{0}`")]
    UnknownTable(String),

    /// A selection artifact for this run already exists.
    #[error("selection `{0}` already exists")]
    SelectionExists(String),

    #[error("unknown selection `{0}`")]
    UnknownSelection(String),

    /// The selection returned no identifiers before its planned length.
    #[error("selection `{selection}` ended at {found} of {expected} rows")]
    SelectionTruncated {
        selection: String,
        expected: u64,
        found: u64,
    },

    /// The backend cancelled a statement on its own timeout.
    #[error("statement timed out")]
    Timeout,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_offset_only_for_partial_progress() {
        let timeout = MutationError::BatchTimeout {
            batch_index: 2,
            cursor: 20,
            end: 30,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.resume_offset(), Some(20));
        assert!(timeout.to_string().contains("batch_start=20"));

        let mismatch = MutationError::RowCountMismatch {
            expected: 2,
            actual: 3,
        };
        assert_eq!(mismatch.resume_offset(), None);
    }
}

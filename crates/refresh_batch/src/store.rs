//! Storage seam used by the planner and the chunk executor.
//!
//! A backend owns two things: the live table being rewritten, and the
//! server-side selection artifacts (`<run_id>_rows_to_update`) that freeze
//! which rows a run will touch. Selections are ordered by row identifier so
//! offset-based batching is reproducible across retries.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Opaque row identifier as stored in the selection.
pub type RowId = String;

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Materializes every identifier of `table` matching `predicate` under
    /// `selection`, returning how many were captured. Fails if the selection
    /// already exists.
    async fn create_selection(
        &self,
        selection: &str,
        table: &str,
        predicate: &str,
    ) -> Result<u64, StoreError>;

    /// Re-opens a previously materialized selection and returns its length.
    async fn attach_selection(&self, selection: &str) -> Result<u64, StoreError>;

    /// Reads at most `limit` identifiers starting at `offset`, in selection order.
    async fn read_selection(
        &self,
        selection: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<RowId>, StoreError>;

    /// Applies `set_clause` to exactly the rows in `ids` as one committed
    /// unit of work, returning the number of rows actually changed.
    ///
    /// Backends bound the work by `timeout` themselves and return
    /// [`StoreError::Timeout`] only when nothing was committed. Callers do
    /// not cancel this future from outside.
    async fn apply_update(
        &self,
        table: &str,
        set_clause: &str,
        ids: &[RowId],
        timeout: Duration,
    ) -> Result<u64, StoreError>;

    /// Removes the selection artifact. Dropping a missing selection is not an error.
    async fn drop_selection(&self, selection: &str) -> Result<(), StoreError>;
}

//! Selection planning: freezes the set of rows a run will rewrite.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{MutationError, MutationResult, StoreError};
use crate::spec::MutationSpec;
use crate::store::RowStore;

/// Handle to a frozen, ordered selection materialized by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionSet {
    name: String,
    run_id: String,
    table: String,
    len: u64,
}

impl SelectionSet {
    /// Server-side artifact name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Rows a run starting at `batch_start` is expected to touch.
pub fn expected_update_count(selection: &SelectionSet, batch_start: Option<u64>) -> u64 {
    selection.len().saturating_sub(batch_start.unwrap_or(0))
}

pub struct BatchPlanner {
    store: Arc<dyn RowStore>,
}

impl BatchPlanner {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self { store }
    }

    /// Materializes the selection for `spec` with one read.
    pub async fn plan(&self, spec: &MutationSpec) -> MutationResult<SelectionSet> {
        let name = spec.selection_name();
        let len = self
            .store
            .create_selection(&name, spec.table(), spec.filter_predicate())
            .await
            .map_err(|err| planning_error(spec, err))?;
        info!(
            run_id = spec.run_id(),
            table = spec.table(),
            selection = %name,
            rows = len,
            "materialized selection"
        );
        Ok(SelectionSet {
            name,
            run_id: spec.run_id().to_string(),
            table: spec.table().to_string(),
            len,
        })
    }

    /// Re-opens the selection a previous invocation with the same run id left behind.
    pub async fn attach(&self, spec: &MutationSpec) -> MutationResult<SelectionSet> {
        let name = spec.selection_name();
        let len = self
            .store
            .attach_selection(&name)
            .await
            .map_err(|err| planning_error(spec, err))?;
        info!(
            run_id = spec.run_id(),
            selection = %name,
            rows = len,
            "re-attached existing selection"
        );
        Ok(SelectionSet {
            name,
            run_id: spec.run_id().to_string(),
            table: spec.table().to_string(),
            len,
        })
    }

    /// Drops the selection artifact.
    pub async fn release(&self, selection: &SelectionSet) -> Result<(), StoreError> {
        self.store.drop_selection(selection.name()).await?;
        debug!(selection = selection.name(), "dropped selection");
        Ok(())
    }
}

fn planning_error(spec: &MutationSpec, err: StoreError) -> MutationError {
    let reason = match err {
        StoreError::SelectionExists(name) => format!(
            "selection `{name}` already exists; pass resume to reuse it or pick a new run_id"
        ),
        StoreError::UnknownSelection(name) => {
            format!("no selection `{name}` to resume from")
        }
        other => other.to_string(),
    };
    MutationError::Planning {
        table: spec.table().to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(len: u64) -> SelectionSet {
        SelectionSet {
            name: "r_rows_to_update".into(),
            run_id: "r".into(),
            table: "image".into(),
            len,
        }
    }

    #[test]
    fn expected_update_count_floors_at_zero() {
        let cases = [(None, 3), (Some(0), 3), (Some(1), 2), (Some(2), 1), (Some(4), 0)];
        for (batch_start, expected) in cases {
            assert_eq!(
                expected_update_count(&selection(3), batch_start),
                expected,
                "batch_start={batch_start:?}"
            );
        }
    }
}

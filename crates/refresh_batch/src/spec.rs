//! Mutation request (wire shape) and the validated, immutable spec built from it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MutationError;

/// Default per-batch budget when the request leaves it at zero.
pub const DEFAULT_PER_BATCH_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default batch size used by callers that do not pick one.
pub const DEFAULT_BATCH_SIZE: u64 = 10_000;

/// Whether batches touch the table or only count what they would touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Read and count only; rows are never written.
    Simulate,
    /// Apply the set clause to every batch.
    Apply,
}

impl ExecutionMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            Self::Simulate
        } else {
            Self::Apply
        }
    }

    pub fn is_simulate(self) -> bool {
        matches!(self, Self::Simulate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simulate => "simulate",
            Self::Apply => "apply",
        }
    }
}

/// Mutation request as accepted from callers (JSON or CLI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub table: String,
    /// SQL fragment selecting target rows, e.g. `WHERE provider = 'flickr'`.
    pub filter_predicate: String,
    /// SQL fragment applied to every selected row, e.g. `SET title = 'x'`.
    pub set_clause: String,
    /// Rows the caller expects to be updated; derived from the selection when absent.
    #[serde(default)]
    pub expected_row_count: Option<u64>,
    pub batch_size: u64,
    #[serde(default)]
    pub batch_start: Option<u64>,
    #[serde(default)]
    pub dry_run: bool,
    /// Overall budget in milliseconds (`0` disables it).
    #[serde(default)]
    pub timeout_ms: u64,
    /// Per-batch budget in milliseconds (`0` picks the default).
    #[serde(default)]
    pub per_batch_timeout_ms: u64,
    /// Unique per invocation; namespaces the server-side selection artifact.
    pub run_id: String,
    /// Reuse the selection already materialized under `run_id`.
    #[serde(default)]
    pub resume: bool,
}

/// Validated, immutable description of one batched mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationSpec {
    table: String,
    filter_predicate: String,
    set_clause: String,
    expected_row_count: Option<u64>,
    batch_size: u64,
    batch_start: u64,
    mode: ExecutionMode,
    timeout: Option<Duration>,
    per_batch_timeout: Duration,
    run_id: String,
    resume: bool,
}

impl MutationSpec {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn filter_predicate(&self) -> &str {
        &self.filter_predicate
    }

    pub fn set_clause(&self) -> &str {
        &self.set_clause
    }

    pub fn expected_row_count(&self) -> Option<u64> {
        self.expected_row_count
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    pub fn batch_start(&self) -> u64 {
        self.batch_start
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Overall operation budget, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn per_batch_timeout(&self) -> Duration {
        self.per_batch_timeout
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn resume(&self) -> bool {
        self.resume
    }

    /// Name of the server-side artifact holding this run's selection.
    pub fn selection_name(&self) -> String {
        selection_name(&self.run_id)
    }
}

/// Artifact name for a run's frozen selection.
pub fn selection_name(run_id: &str) -> String {
    format!("{run_id}_rows_to_update")
}

/// Run ids end up inside table names, so only `[A-Za-z0-9_]` is accepted.
fn validate_run_id(run_id: &str) -> Result<(), MutationError> {
    if run_id.is_empty() {
        return Err(MutationError::InvalidSpec("run_id must not be empty".into()));
    }
    if !run_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(MutationError::InvalidSpec(format!(
            "run_id `{run_id}` may only contain ASCII letters, digits and `_`"
        )));
    }
    Ok(())
}

fn validate_table(table: &str) -> Result<(), MutationError> {
    let valid = !table.is_empty()
        && table.split('.').all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(MutationError::InvalidSpec(format!(
            "table `{table}` is not a plain (optionally schema-qualified) identifier"
        )))
    }
}

impl TryFrom<MutationRequest> for MutationSpec {
    type Error = MutationError;

    fn try_from(request: MutationRequest) -> Result<Self, Self::Error> {
        let table = request.table.trim().to_string();
        validate_table(&table)?;
        validate_run_id(&request.run_id)?;
        if request.batch_size == 0 {
            return Err(MutationError::InvalidSpec(
                "batch_size must be greater than zero".into(),
            ));
        }
        let set_clause = request.set_clause.trim().to_string();
        if set_clause.is_empty() {
            return Err(MutationError::InvalidSpec("set_clause must not be empty".into()));
        }
        let per_batch_timeout = if request.per_batch_timeout_ms == 0 {
            DEFAULT_PER_BATCH_TIMEOUT
        } else {
            Duration::from_millis(request.per_batch_timeout_ms)
        };
        let timeout = (request.timeout_ms > 0).then(|| Duration::from_millis(request.timeout_ms));

        Ok(Self {
            table,
            filter_predicate: request.filter_predicate.trim().to_string(),
            set_clause,
            expected_row_count: request.expected_row_count,
            batch_size: request.batch_size,
            batch_start: request.batch_start.unwrap_or(0),
            mode: ExecutionMode::from_dry_run(request.dry_run),
            timeout,
            per_batch_timeout,
            run_id: request.run_id,
            resume: request.resume,
        })
    }
}

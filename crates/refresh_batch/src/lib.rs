//! Batched, resumable row mutation for tables that stay live during the rewrite.
//!
//! A run has four steps:
//! - the [`BatchPlanner`] freezes the target rows into an ordered server-side selection,
//! - the [`ChunkExecutor`] rewrites that selection `batch_size` rows at a time,
//!   each batch committed on its own and bounded by a per-batch timeout,
//! - the [`ProgressTracker`] exposes the cursor so a failed run can be resumed
//!   by passing it back as `batch_start`,
//! - the [`VerificationGate`] compares the affected total with the expected count.
//!
//! [`BatchedMutation`] wires the steps together. Storage is reached through
//! the [`RowStore`] trait, with an in-memory backend and a PostgreSQL backend.

pub mod engine;
pub mod error;
pub mod executor;
pub mod memory;
pub mod planner;
pub mod popularity;
pub mod postgres;
pub mod progress;
pub mod spec;
pub mod store;
pub mod verify;

pub use engine::{BatchedMutation, MutationOutcome};
pub use error::{MutationError, MutationResult, StoreError};
pub use executor::ChunkExecutor;
pub use memory::MemoryStore;
pub use planner::{expected_update_count, BatchPlanner, SelectionSet};
pub use popularity::{MediaType, PopularitySql};
pub use postgres::PgRowStore;
pub use progress::{BatchRecord, ProgressSnapshot, ProgressTracker, RunPhase};
pub use spec::{ExecutionMode, MutationRequest, MutationSpec};
pub use store::{RowId, RowStore};
pub use verify::{Verdict, VerificationGate};

//! Advisory mutual exclusion between independently scheduled refresh workflows.
//!
//! Workflows that touch the same downstream cluster share a resource tag
//! ([`ResourceTagRegistry`]). Before entering, a run waits on the
//! [`ConflictSensor`] until no other live run carries its tag. Live runs are
//! reported by an [`ActiveRunSource`]: the scheduler's snapshot, a static
//! list, or the in-process [`ClaimBoard`].

pub mod claim;
pub mod error;
pub mod runs;
pub mod sensor;
pub mod tags;

pub use claim::{ClaimBoard, ConflictToken, Coordinator};
pub use error::{CoordinationError, CoordinationResult};
pub use runs::{
    ActiveRunSource, CombinedRunSource, FileRunSource, RunState, StaticRunSource, WorkflowRunView,
};
pub use sensor::{ConflictSensor, CoordinationRequest, DEFAULT_POLL_INTERVAL};
pub use tags::{ResourceTagRegistry, PRODUCTION_ES_CONCURRENCY, STAGING_ES_CONCURRENCY};

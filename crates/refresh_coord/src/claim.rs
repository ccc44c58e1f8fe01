//! In-process claims on resource tags.
//!
//! A [`ConflictToken`] marks its run as live on the tag until it is dropped,
//! whether or not the region succeeds. The [`ClaimBoard`] reports held claims
//! through [`ActiveRunSource`], so cooperating runs in one process block each
//! other through the same [`ConflictSensor`] path as scheduler runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};

use crate::error::{CoordinationError, CoordinationResult};
use crate::runs::{ActiveRunSource, CombinedRunSource, RunState, WorkflowRunView};
use crate::sensor::{ConflictSensor, CoordinationRequest};

#[derive(Debug, Clone)]
struct Claim {
    tag: String,
    run_id: String,
    workflow_id: String,
}

#[derive(Debug, Default)]
struct BoardInner {
    claims: Mutex<BTreeMap<u64, Claim>>,
    next_id: AtomicU64,
}

impl BoardInner {
    fn claims(&self) -> MutexGuard<'_, BTreeMap<u64, Claim>> {
        self.claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared registry of held claims; clones see the same board.
#[derive(Debug, Clone, Default)]
pub struct ClaimBoard {
    inner: Arc<BoardInner>,
}

impl ClaimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a claim without checking for conflicts.
    pub fn claim(&self, tag: &str, run_id: &str, workflow_id: &str) -> ConflictToken {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.claims().insert(
            id,
            Claim {
                tag: tag.to_string(),
                run_id: run_id.to_string(),
                workflow_id: workflow_id.to_string(),
            },
        );
        debug!(tag, run_id, "claim taken");
        self.token(id, tag, run_id)
    }

    /// Claims `tag` unless a run other than `run_id` or `excluded_run_ids`
    /// already holds it. The check and the insert happen under one lock, so
    /// two callers in this process can never both succeed. On conflict the
    /// blocking run ids are returned.
    pub fn try_claim(
        &self,
        tag: &str,
        run_id: &str,
        workflow_id: &str,
        excluded_run_ids: &[String],
    ) -> Result<ConflictToken, Vec<String>> {
        let mut claims = self.inner.claims();
        let blocking = claims
            .values()
            .filter(|claim| claim.tag == tag && claim.run_id != run_id)
            .filter(|claim| !excluded_run_ids.contains(&claim.run_id))
            .map(|claim| claim.run_id.clone())
            .collect::<Vec<_>>();
        if !blocking.is_empty() {
            return Err(blocking);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        claims.insert(
            id,
            Claim {
                tag: tag.to_string(),
                run_id: run_id.to_string(),
                workflow_id: workflow_id.to_string(),
            },
        );
        drop(claims);
        debug!(tag, run_id, "claim taken");
        Ok(self.token(id, tag, run_id))
    }

    fn token(&self, id: u64, tag: &str, run_id: &str) -> ConflictToken {
        ConflictToken {
            board: self.inner.clone(),
            id,
            tag: tag.to_string(),
            run_id: run_id.to_string(),
        }
    }

    /// Run ids currently holding `tag`.
    pub fn holders(&self, tag: &str) -> Vec<String> {
        self.inner
            .claims()
            .values()
            .filter(|claim| claim.tag == tag)
            .map(|claim| claim.run_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.claims().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn views(&self, keep: impl Fn(&Claim) -> bool) -> Vec<WorkflowRunView> {
        self.inner
            .claims()
            .values()
            .filter(|claim| keep(claim))
            .map(|claim| WorkflowRunView {
                run_id: claim.run_id.clone(),
                workflow_id: claim.workflow_id.clone(),
                tags: vec![claim.tag.clone()],
                state: RunState::Running,
            })
            .collect()
    }
}

#[async_trait]
impl ActiveRunSource for ClaimBoard {
    async fn active_runs(&self, tag: &str) -> anyhow::Result<Vec<WorkflowRunView>> {
        Ok(self.views(|claim| claim.tag == tag))
    }

    async fn active_runs_for_workflows(
        &self,
        workflow_ids: &[String],
    ) -> anyhow::Result<Vec<WorkflowRunView>> {
        Ok(self.views(|claim| workflow_ids.contains(&claim.workflow_id)))
    }
}

/// Held claim on a tag; released on drop.
#[derive(Debug)]
pub struct ConflictToken {
    board: Arc<BoardInner>,
    id: u64,
    tag: String,
    run_id: String,
}

impl ConflictToken {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for ConflictToken {
    fn drop(&mut self) {
        self.board.claims().remove(&self.id);
        debug!(tag = %self.tag, run_id = %self.run_id, "claim released");
    }
}

/// Gate for a coordinated region: waits out conflicts, then claims the tag.
pub struct Coordinator {
    sensor: ConflictSensor,
    board: ClaimBoard,
}

impl Coordinator {
    /// Conflicts are read from `external` (the scheduler) and from `board`.
    pub fn new(external: Arc<dyn ActiveRunSource>, board: ClaimBoard) -> Self {
        let combined = CombinedRunSource::new(vec![external, Arc::new(board.clone())]);
        Self {
            sensor: ConflictSensor::new(Arc::new(combined)),
            board,
        }
    }

    /// Coordinator over in-process claims only.
    pub fn local(board: ClaimBoard) -> Self {
        Self {
            sensor: ConflictSensor::new(Arc::new(board.clone())),
            board,
        }
    }

    pub fn board(&self) -> &ClaimBoard {
        &self.board
    }

    /// Waits per `request` and claims its tag for `run_id`. Nothing is held if
    /// the wait fails. The caller's own run id is always excluded.
    pub async fn enter(
        &self,
        request: &CoordinationRequest,
        run_id: &str,
        workflow_id: &str,
    ) -> CoordinationResult<ConflictToken> {
        let mut request = request.clone();
        if !request.excluded_run_ids.iter().any(|id| id == run_id) {
            request.excluded_run_ids.push(run_id.to_string());
        }
        let span = info_span!("coordinated_entry", tag = %request.tag, run_id);
        self.enter_inner(request, run_id, workflow_id)
            .instrument(span)
            .await
    }

    async fn enter_inner(
        &self,
        mut request: CoordinationRequest,
        run_id: &str,
        workflow_id: &str,
    ) -> CoordinationResult<ConflictToken> {
        let started = Instant::now();
        let deadline = started + request.timeout();
        loop {
            self.sensor.await_all(&request).await?;
            match self.board.try_claim(
                &request.tag,
                run_id,
                workflow_id,
                &request.excluded_run_ids,
            ) {
                Ok(token) => {
                    info!(tag = %request.tag, run_id, "entered coordinated region");
                    return Ok(token);
                }
                Err(blocking) => {
                    // Lost the claim to a run in this process; wait it out
                    // with whatever budget is left.
                    debug!(?blocking, "tag claimed after the wait cleared");
                    let now = Instant::now();
                    let remaining = deadline.saturating_duration_since(now);
                    if remaining.is_zero() {
                        return Err(CoordinationError::ConflictTimeout {
                            tag: request.tag.clone(),
                            waited: now.duration_since(started),
                            blocking,
                        });
                    }
                    request.timeout_ms = remaining.as_millis().min(u128::from(u64::MAX)) as u64;
                }
            }
        }
    }
}

//! Polling wait that blocks entry while conflicting runs are live.
//!
//! The check is advisory: two runs polling at the same instant can both see
//! a clear board. Waiting suspends the task with `tokio::time::sleep`, so no
//! worker thread is held while a conflict persists.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CoordinationError, CoordinationResult};
use crate::runs::ActiveRunSource;

/// Default delay between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Polls never run closer together than this.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Wire shape of a coordination request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationRequest {
    pub tag: String,
    /// Run ids that never count as conflicts, typically the caller's own.
    #[serde(default)]
    pub excluded_run_ids: Vec<String>,
    /// Workflows that must have no live run before the tag is checked. Runs
    /// of these workflows are then ignored by the tag check.
    #[serde(default)]
    pub workflow_ids: Vec<String>,
    #[serde(default)]
    pub poll_interval_ms: u64,
    /// Total budget across both steps; `0` fails on the first conflicting poll.
    #[serde(default)]
    pub timeout_ms: u64,
}

impl CoordinationRequest {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            excluded_run_ids: Vec::new(),
            workflow_ids: Vec::new(),
            poll_interval_ms: 0,
            timeout_ms: 0,
        }
    }

    /// Poll interval, falling back to [`DEFAULT_POLL_INTERVAL`] when unset.
    pub fn poll_interval(&self) -> Duration {
        if self.poll_interval_ms == 0 {
            DEFAULT_POLL_INTERVAL
        } else {
            Duration::from_millis(self.poll_interval_ms)
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What a single poll looks for.
enum Probe<'a> {
    Tag {
        tag: &'a str,
        excluded_runs: &'a [String],
        excluded_workflows: &'a [String],
    },
    Workflows {
        workflow_ids: &'a [String],
        excluded_runs: &'a [String],
    },
}

/// Runs still blocking when the budget ran out.
struct Blocked {
    waited: Duration,
    blocking: Vec<String>,
}

pub struct ConflictSensor {
    source: Arc<dyn ActiveRunSource>,
}

impl ConflictSensor {
    pub fn new(source: Arc<dyn ActiveRunSource>) -> Self {
        Self { source }
    }

    /// Returns once no live run other than `excluded_run_ids` carries `tag`.
    pub async fn await_clear(
        &self,
        tag: &str,
        excluded_run_ids: &[String],
        poll_interval: Duration,
        timeout: Duration,
    ) -> CoordinationResult<()> {
        let deadline = Instant::now() + timeout;
        self.await_tag(tag, excluded_run_ids, &[], poll_interval, deadline)
            .await
    }

    /// Returns once no live run of `workflow_ids` (other than the excluded
    /// run ids) exists.
    pub async fn await_workflows_idle(
        &self,
        workflow_ids: &[String],
        excluded_run_ids: &[String],
        poll_interval: Duration,
        timeout: Duration,
    ) -> CoordinationResult<()> {
        let deadline = Instant::now() + timeout;
        self.await_workflows(workflow_ids, excluded_run_ids, poll_interval, deadline)
            .await
    }

    /// Waits for the listed workflows to go idle, then for the tag to clear,
    /// both inside one shared budget.
    pub async fn await_all(&self, request: &CoordinationRequest) -> CoordinationResult<()> {
        let deadline = Instant::now() + request.timeout();
        let poll_interval = request.poll_interval();
        if !request.workflow_ids.is_empty() {
            self.await_workflows(
                &request.workflow_ids,
                &request.excluded_run_ids,
                poll_interval,
                deadline,
            )
            .await?;
        }
        self.await_tag(
            &request.tag,
            &request.excluded_run_ids,
            &request.workflow_ids,
            poll_interval,
            deadline,
        )
        .await
    }

    async fn await_tag(
        &self,
        tag: &str,
        excluded_runs: &[String],
        excluded_workflows: &[String],
        poll_interval: Duration,
        deadline: Instant,
    ) -> CoordinationResult<()> {
        let probe = Probe::Tag {
            tag,
            excluded_runs,
            excluded_workflows,
        };
        self.poll(&probe, poll_interval, deadline)
            .await?
            .map_err(|blocked| CoordinationError::ConflictTimeout {
                tag: tag.to_string(),
                waited: blocked.waited,
                blocking: blocked.blocking,
            })
    }

    async fn await_workflows(
        &self,
        workflow_ids: &[String],
        excluded_runs: &[String],
        poll_interval: Duration,
        deadline: Instant,
    ) -> CoordinationResult<()> {
        let probe = Probe::Workflows {
            workflow_ids,
            excluded_runs,
        };
        self.poll(&probe, poll_interval, deadline)
            .await?
            .map_err(|blocked| CoordinationError::WorkflowsBusy {
                workflow_ids: workflow_ids.to_vec(),
                waited: blocked.waited,
                blocking: blocked.blocking,
            })
    }

    /// Outer error: the source kept failing until the deadline. Inner error:
    /// conflicts were still present at the deadline.
    async fn poll(
        &self,
        probe: &Probe<'_>,
        poll_interval: Duration,
        deadline: Instant,
    ) -> CoordinationResult<Result<(), Blocked>> {
        let started = Instant::now();
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let mut polls = 0u64;
        loop {
            polls += 1;
            let result = self.blocking_runs(probe).await;
            let now = Instant::now();
            match result {
                Ok(blocking) if blocking.is_empty() => {
                    if polls > 1 {
                        info!(
                            waited_ms = now.duration_since(started).as_millis() as u64,
                            polls, "conflicts cleared"
                        );
                    }
                    return Ok(Ok(()));
                }
                Ok(blocking) => {
                    if now >= deadline {
                        return Ok(Err(Blocked {
                            waited: now.duration_since(started),
                            blocking,
                        }));
                    }
                    debug!(blocking = ?blocking, polls, "conflicting runs active; waiting");
                }
                Err(err) => {
                    if now >= deadline {
                        return Err(CoordinationError::Source(err));
                    }
                    warn!(error = %err, polls, "active run query failed; retrying");
                }
            }
            tokio::time::sleep(poll_interval.min(deadline.saturating_duration_since(now))).await;
        }
    }

    async fn blocking_runs(&self, probe: &Probe<'_>) -> anyhow::Result<Vec<String>> {
        let mut blocking = match probe {
            Probe::Tag {
                tag,
                excluded_runs,
                excluded_workflows,
            } => self
                .source
                .active_runs(tag)
                .await?
                .into_iter()
                .filter(|run| run.is_live() && run.has_tag(tag))
                .filter(|run| !excluded_runs.contains(&run.run_id))
                .filter(|run| !excluded_workflows.contains(&run.workflow_id))
                .map(|run| run.run_id)
                .collect::<Vec<_>>(),
            Probe::Workflows {
                workflow_ids,
                excluded_runs,
            } => self
                .source
                .active_runs_for_workflows(workflow_ids)
                .await?
                .into_iter()
                .filter(|run| run.is_live() && workflow_ids.contains(&run.workflow_id))
                .filter(|run| !excluded_runs.contains(&run.run_id))
                .map(|run| run.run_id)
                .collect::<Vec<_>>(),
        };
        blocking.sort();
        blocking.dedup();
        Ok(blocking)
    }
}

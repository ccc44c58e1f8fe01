//! Views of scheduler runs and the sources that report them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Success,
    Failed,
}

impl RunState {
    /// Queued and running runs both hold their resources.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

/// One workflow run as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRunView {
    pub run_id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub state: RunState,
}

impl WorkflowRunView {
    pub fn new(run_id: &str, workflow_id: &str, tags: &[&str], state: RunState) -> Self {
        Self {
            run_id: run_id.to_string(),
            workflow_id: workflow_id.to_string(),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            state,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|candidate| candidate == tag)
    }
}

/// Reports which runs are currently live.
///
/// Implementations may return non-live or non-matching runs; the sensor
/// filters again before deciding.
#[async_trait]
pub trait ActiveRunSource: Send + Sync {
    /// Live runs carrying `tag`.
    async fn active_runs(&self, tag: &str) -> anyhow::Result<Vec<WorkflowRunView>>;

    /// Live runs of any of `workflow_ids`.
    async fn active_runs_for_workflows(
        &self,
        workflow_ids: &[String],
    ) -> anyhow::Result<Vec<WorkflowRunView>>;
}

fn live_with_tag(runs: &[WorkflowRunView], tag: &str) -> Vec<WorkflowRunView> {
    runs.iter()
        .filter(|run| run.is_live() && run.has_tag(tag))
        .cloned()
        .collect()
}

fn live_in_workflows(runs: &[WorkflowRunView], workflow_ids: &[String]) -> Vec<WorkflowRunView> {
    runs.iter()
        .filter(|run| run.is_live() && workflow_ids.contains(&run.workflow_id))
        .cloned()
        .collect()
}

/// In-memory run list whose states can be changed while a sensor polls it.
#[derive(Debug, Default)]
pub struct StaticRunSource {
    runs: Mutex<Vec<WorkflowRunView>>,
    polls: AtomicU64,
}

impl StaticRunSource {
    pub fn new(runs: Vec<WorkflowRunView>) -> Self {
        Self {
            runs: Mutex::new(runs),
            polls: AtomicU64::new(0),
        }
    }

    fn runs(&self) -> MutexGuard<'_, Vec<WorkflowRunView>> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, run: WorkflowRunView) {
        self.runs().push(run);
    }

    /// Returns false if no run has this id.
    pub fn set_state(&self, run_id: &str, state: RunState) -> bool {
        let mut runs = self.runs();
        match runs.iter_mut().find(|run| run.run_id == run_id) {
            Some(run) => {
                run.state = state;
                true
            }
            None => false,
        }
    }

    /// Number of queries answered so far.
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActiveRunSource for StaticRunSource {
    async fn active_runs(&self, tag: &str) -> anyhow::Result<Vec<WorkflowRunView>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(live_with_tag(&self.runs(), tag))
    }

    async fn active_runs_for_workflows(
        &self,
        workflow_ids: &[String],
    ) -> anyhow::Result<Vec<WorkflowRunView>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(live_in_workflows(&self.runs(), workflow_ids))
    }
}

/// JSON array of [`WorkflowRunView`] maintained by the scheduler, re-read on
/// every query so state changes are picked up between polls.
#[derive(Debug, Clone)]
pub struct FileRunSource {
    path: PathBuf,
}

impl FileRunSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> anyhow::Result<Vec<WorkflowRunView>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read run snapshot {}", self.path.display()))?;
        let runs: Vec<WorkflowRunView> = serde_json::from_str(&raw)
            .with_context(|| format!("parse run snapshot {}", self.path.display()))?;
        debug!(path = %self.path.display(), runs = runs.len(), "loaded run snapshot");
        Ok(runs)
    }
}

#[async_trait]
impl ActiveRunSource for FileRunSource {
    async fn active_runs(&self, tag: &str) -> anyhow::Result<Vec<WorkflowRunView>> {
        Ok(live_with_tag(&self.load().await?, tag))
    }

    async fn active_runs_for_workflows(
        &self,
        workflow_ids: &[String],
    ) -> anyhow::Result<Vec<WorkflowRunView>> {
        Ok(live_in_workflows(&self.load().await?, workflow_ids))
    }
}

/// Union of several sources, e.g. the scheduler plus in-process claims.
#[derive(Default)]
pub struct CombinedRunSource {
    sources: Vec<Arc<dyn ActiveRunSource>>,
}

impl CombinedRunSource {
    pub fn new(sources: Vec<Arc<dyn ActiveRunSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl ActiveRunSource for CombinedRunSource {
    async fn active_runs(&self, tag: &str) -> anyhow::Result<Vec<WorkflowRunView>> {
        let mut all = Vec::new();
        for source in &self.sources {
            all.extend(source.active_runs(tag).await?);
        }
        Ok(all)
    }

    async fn active_runs_for_workflows(
        &self,
        workflow_ids: &[String],
    ) -> anyhow::Result<Vec<WorkflowRunView>> {
        let mut all = Vec::new();
        for source in &self.sources {
            all.extend(source.active_runs_for_workflows(workflow_ids).await?);
        }
        Ok(all)
    }
}

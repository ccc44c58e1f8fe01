use std::time::Duration;

use thiserror::Error;

pub type CoordinationResult<T> = Result<T, CoordinationError>;

#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Runs holding the tag were still live when the wait budget ran out.
    #[error(
        "runs sharing `{tag}` still active after {waited:?}: {}",
        blocking.join(", ")
    )]
    ConflictTimeout {
        tag: String,
        waited: Duration,
        blocking: Vec<String>,
    },

    /// Runs of the named workflows were still live when the wait budget ran out.
    #[error(
        "workflows [{}] still running after {waited:?}: {}",
        workflow_ids.join(", "),
        blocking.join(", ")
    )]
    WorkflowsBusy {
        workflow_ids: Vec<String>,
        waited: Duration,
        blocking: Vec<String>,
    },

    /// The run source could not be queried before the budget ran out.
    #[error("active run source failed: {0:#}")]
    Source(#[source] anyhow::Error),

    #[error("invalid resource tag registry: {0}")]
    Registry(String),
}

impl CoordinationError {
    /// Run ids that kept the wait from clearing, if the wait timed out.
    pub fn blocking(&self) -> &[String] {
        match self {
            Self::ConflictTimeout { blocking, .. } | Self::WorkflowsBusy { blocking, .. } => {
                blocking
            }
            Self::Source(_) | Self::Registry(_) => &[],
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConflictTimeout { .. } | Self::WorkflowsBusy { .. }
        )
    }
}

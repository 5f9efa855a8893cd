//! Workflow status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a workflow run.
///
/// ```text
/// pending -> running -> completed | failed | cancelled | paused
/// paused  -> running | cancelled
/// failed  -> running | paused | pending | completed | failed   (recovery)
/// ```
///
/// `completed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal states end the run for good and carry an end time.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Cancelled)
    }

    /// Returns `true` if moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        if self.is_terminal() {
            return false;
        }
        if self == next {
            return true;
        }
        match self {
            Pending => matches!(next, Running | Cancelled),
            Running => matches!(next, Completed | Failed | Cancelled | Paused),
            Paused => matches!(next, Running | Cancelled),
            Failed => matches!(next, Running | Paused | Pending | Completed),
            Completed | Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

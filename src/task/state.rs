//! Task state machine.

use serde::{Deserialize, Serialize};

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Task is waiting to be claimed by the dispatch loop.
    Pending,
    /// Task is currently being executed.
    Running,
    /// Task finished successfully.
    Completed,
    /// Task failed and cannot be completed.
    Failed,
    /// Task was cancelled.
    Cancelled,
    /// Execution is paused until the submitter supplies more input.
    InputRequired,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    ///
    /// `Running -> Pending` exists only for the recovery sweep, which
    /// re-queues tasks orphaned by a crashed executor.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Running) | (Pending, Cancelled) |
            // From Running
            (Running, Completed) | (Running, Failed) |
            (Running, InputRequired) | (Running, Cancelled) |
            // Recovery sweep re-queue
            (Running, Pending) |
            // From InputRequired (explicit resume, or cancel of paused work)
            (InputRequired, Running) | (InputRequired, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the task is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::InputRequired => "input_required",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "input_required" => Ok(Self::InputRequired),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

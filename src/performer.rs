//! `WorkPerformer` — the seam to the external work-performing engine.
//!
//! The core's only dependency on the reasoning/execution layer: it hands the
//! performer an input plus opaque metadata and receives a final payload, a
//! request for more input, or an error.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

/// Outcome of one performer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Work finished; carries the final result payload.
    Completed(String),
    /// Work is paused until the submitter supplies more input; carries a
    /// message describing what is needed.
    NeedsInput(String),
}

/// Failure raised by the work-performer. The message ends up in `task.error`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct WorkError(pub String);

impl WorkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Intermediate activity reported by a performer mid-invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkReport {
    Progress(String),
    Log(String),
}

/// Execution context handed to the performer for one invocation.
///
/// Progress and log reports are forwarded by the executor into the task's
/// event log so streaming and polling observers see live detail. The cancel
/// signal flips to `true` when cancellation is requested; performers should
/// check it at their checkpoints.
pub struct WorkContext {
    reports: mpsc::UnboundedSender<WorkReport>,
    cancel: watch::Receiver<bool>,
}

impl WorkContext {
    pub(crate) fn new(
        cancel: watch::Receiver<bool>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                reports: tx,
                cancel,
            },
            rx,
        )
    }

    /// Report intermediate progress.
    pub fn progress(&self, message: impl Into<String>) {
        let _ = self.reports.send(WorkReport::Progress(message.into()));
    }

    /// Report a log line.
    pub fn log(&self, message: impl Into<String>) {
        let _ = self.reports.send(WorkReport::Log(message.into()));
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// A clone of the cancel signal, for performers that want to `select!`
    /// on it rather than poll.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.clone()
    }
}

/// External collaborator that actually produces a task's result.
#[async_trait]
pub trait WorkPerformer: Send + Sync {
    /// Perform the work described by `input`.
    ///
    /// `metadata` is the submitter-supplied pass-through map (execution
    /// profile, instruction set, and the like).
    async fn invoke(
        &self,
        input: &str,
        metadata: &serde_json::Value,
        ctx: &WorkContext,
    ) -> Result<WorkOutcome, WorkError>;
}

//! Task and TaskEvent value objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::state::TaskState;

/// Kind of event recorded in a task's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EventKind {
    /// A state machine transition.
    StateChange { from: TaskState, to: TaskState },
    /// Intermediate activity reported by the work-performer.
    Progress,
    /// Free-form log line.
    Log,
}

/// An immutable record of one state change, progress signal, or log line.
///
/// Events are strictly ordered per task: `seq` is assigned by the store at
/// append time, starting at 1, and append order is causal order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Owning task.
    pub task_id: Uuid,
    /// Per-task sequence number, assigned by the store.
    pub seq: u64,
    /// What happened.
    pub kind: EventKind,
    /// Opaque payload (progress detail, log line, transition reason).
    pub payload: String,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
}

/// One unit of delegated work, tracked through the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique id, generated at creation, immutable.
    pub id: Uuid,
    /// Current state.
    pub state: TaskState,
    /// Work payload supplied by the submitter; opaque to the core.
    pub input: String,
    /// Final payload, present only when state is Completed.
    pub result: Option<String>,
    /// Failure message, present only when state is Failed.
    pub error: Option<String>,
    /// Opaque pass-through data for the executor (e.g. execution profile).
    pub metadata: serde_json::Value,
    /// Append-only event log.
    pub events: Vec<TaskEvent>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// Bumped on every state change and event append; the recovery sweep
    /// uses this as the staleness heartbeat.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new Pending task with a fresh id.
    pub fn new(input: impl Into<String>, metadata: Option<serde_json::Value>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            state: TaskState::Pending,
            input: input.into(),
            result: None,
            error: None,
            metadata: metadata.unwrap_or(serde_json::Value::Null),
            events: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sequence number of the last recorded event (0 if none).
    pub fn last_event_seq(&self) -> u64 {
        self.events.last().map(|e| e.seq).unwrap_or(0)
    }
}

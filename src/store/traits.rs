//! `TaskStore` trait — single async interface for task persistence.
//!
//! The broker and executor mutate tasks only through these operations; the
//! store is the single source of truth for state and event history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::task::{EventKind, Task, TaskEvent, TaskState};

/// Backend-agnostic persistence for tasks and their event logs.
///
/// Implementations must make `update_state` and `next_pending` atomic enough
/// that no two concurrent callers claim the same pending task and no observer
/// ever sees a state go backwards.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task in Pending state.
    ///
    /// Fails with `DuplicateId` if the id already exists.
    async fn create(&self, task: Task) -> Result<Task, StoreError>;

    /// Get a task snapshot (including its full event log), or `None`.
    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Atomically transition state, optionally attaching result/error.
    ///
    /// Validates the transition table and refuses any transition out of a
    /// terminal state with `InvalidTransition`. Appends the `StateChange`
    /// event in the same critical section so event order matches state
    /// linearization. `result` is stored only for `Completed`, `error` only
    /// for `Failed`.
    async fn update_state(
        &self,
        id: Uuid,
        new_state: TaskState,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<Task, StoreError>;

    /// All tasks currently in the given state.
    async fn list_by_state(&self, state: TaskState) -> Result<Vec<Task>, StoreError>;

    /// Atomically claim the oldest Pending task, transitioning it to Running.
    ///
    /// Returns `None` when no work is pending. Two concurrent callers must
    /// never both receive the same task.
    async fn next_pending(&self) -> Result<Option<Task>, StoreError>;

    /// Append an event to the task's log, assigning the next sequence number.
    ///
    /// Also bumps the task's `updated_at` heartbeat.
    async fn add_event(
        &self,
        id: Uuid,
        kind: EventKind,
        payload: String,
    ) -> Result<TaskEvent, StoreError>;

    /// Events with `seq` strictly greater than `after_seq`, in order.
    async fn events_since(&self, id: Uuid, after_seq: u64) -> Result<Vec<TaskEvent>, StoreError>;

    /// Re-queue Running tasks whose heartbeat predates `older_than`.
    ///
    /// Tasks in `exclude` (still tracked by a live executor) are skipped.
    /// Returns the re-queued snapshots.
    async fn requeue_stale(
        &self,
        older_than: DateTime<Utc>,
        exclude: &[Uuid],
    ) -> Result<Vec<Task>, StoreError>;

    /// Replace the task's input payload (used by `resume`).
    ///
    /// Rejected with `InvalidTransition` on terminal tasks.
    async fn set_input(&self, id: Uuid, input: String) -> Result<Task, StoreError>;
}

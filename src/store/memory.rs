//! In-memory `TaskStore` backend.
//!
//! Reference implementation for tests and single-process deployments. The
//! map's write lock is the critical section for claims and transitions, so
//! state linearization and event ordering come for free.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::traits::TaskStore;
use crate::task::{EventKind, Task, TaskEvent, TaskState};

/// In-memory task store.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Append an event to a task held under the write lock.
fn push_event(task: &mut Task, kind: EventKind, payload: String) -> TaskEvent {
    let event = TaskEvent {
        task_id: task.id,
        seq: task.last_event_seq() + 1,
        kind,
        payload,
        timestamp: Utc::now(),
    };
    task.events.push(event.clone());
    task.updated_at = event.timestamp;
    event
}

/// Validate and apply a state transition to a task held under the write lock.
fn apply_transition(
    task: &mut Task,
    new_state: TaskState,
    result: Option<String>,
    error: Option<String>,
) -> Result<(), StoreError> {
    let from = task.state;
    if !from.can_transition_to(new_state) {
        return Err(StoreError::InvalidTransition {
            id: task.id,
            from,
            to: new_state,
        });
    }

    task.state = new_state;
    match new_state {
        TaskState::Completed => {
            task.result = result;
            task.error = None;
        }
        TaskState::Failed => {
            task.error = error;
            task.result = None;
        }
        _ => {}
    }
    push_event(
        task,
        EventKind::StateChange {
            from,
            to: new_state,
        },
        format!("{from} -> {new_state}"),
    );
    Ok(())
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create(&self, task: Task) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::DuplicateId { id: task.id });
        }
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn update_state(
        &self,
        id: Uuid,
        new_state: TaskState,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound { id })?;
        apply_transition(task, new_state, result, error)?;
        Ok(task.clone())
    }

    async fn list_by_state(&self, state: TaskState) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut matching: Vec<Task> = tasks.values().filter(|t| t.state == state).cloned().collect();
        matching.sort_by_key(|t| t.created_at);
        Ok(matching)
    }

    async fn next_pending(&self) -> Result<Option<Task>, StoreError> {
        let mut tasks = self.tasks.write().await;
        let claimed = tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .min_by_key(|t| (t.created_at, t.id))
            .map(|t| t.id);

        match claimed {
            Some(id) => {
                let task = tasks.get_mut(&id).ok_or(StoreError::NotFound { id })?;
                apply_transition(task, TaskState::Running, None, None)?;
                Ok(Some(task.clone()))
            }
            None => Ok(None),
        }
    }

    async fn add_event(
        &self,
        id: Uuid,
        kind: EventKind,
        payload: String,
    ) -> Result<TaskEvent, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound { id })?;
        Ok(push_event(task, kind, payload))
    }

    async fn events_since(&self, id: Uuid, after_seq: u64) -> Result<Vec<TaskEvent>, StoreError> {
        let tasks = self.tasks.read().await;
        let task = tasks.get(&id).ok_or(StoreError::NotFound { id })?;
        Ok(task
            .events
            .iter()
            .filter(|e| e.seq > after_seq)
            .cloned()
            .collect())
    }

    async fn requeue_stale(
        &self,
        older_than: DateTime<Utc>,
        exclude: &[Uuid],
    ) -> Result<Vec<Task>, StoreError> {
        let mut tasks = self.tasks.write().await;
        let stale: Vec<Uuid> = tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Running
                    && t.updated_at < older_than
                    && !exclude.contains(&t.id)
            })
            .map(|t| t.id)
            .collect();

        let mut requeued = Vec::with_capacity(stale.len());
        for id in stale {
            let task = tasks.get_mut(&id).ok_or(StoreError::NotFound { id })?;
            apply_transition(task, TaskState::Pending, None, None)?;
            requeued.push(task.clone());
        }
        Ok(requeued)
    }

    async fn set_input(&self, id: Uuid, input: String) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound { id })?;
        if task.state.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id,
                from: task.state,
                to: task.state,
            });
        }
        task.input = input;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }
}

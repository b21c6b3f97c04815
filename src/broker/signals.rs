//! Per-task event signaling.
//!
//! One broadcast channel per observed task, created on first subscribe or
//! publish and removed once the task reaches a terminal state, so a
//! long-lived broker does not accumulate channels for finished tasks.
//! Dropping the sender still lets existing receivers drain buffered events.

use std::collections::HashMap;

use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::TaskStore;
use crate::task::{EventKind, Task, TaskEvent, TaskState};

/// Registry of live per-task event channels.
pub struct SignalHub {
    capacity: usize,
    channels: RwLock<HashMap<Uuid, broadcast::Sender<TaskEvent>>>,
}

impl SignalHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to a task's live events, creating the channel if needed.
    pub async fn subscribe(&self, id: Uuid) -> broadcast::Receiver<TaskEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish an event to live subscribers, if any.
    pub async fn publish(&self, event: &TaskEvent) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(&event.task_id) {
            // Send fails only when no receiver is subscribed.
            let _ = tx.send(event.clone());
        }
    }

    /// Drop a task's channel. Existing receivers drain what was sent, then
    /// observe `Closed`.
    pub async fn remove(&self, id: Uuid) {
        self.channels.write().await.remove(&id);
    }

    /// Drop a task's channel if no receiver is subscribed anymore.
    ///
    /// Called when an observer finishes, so channels re-created by late
    /// subscribers to terminal tasks do not accumulate.
    pub async fn prune(&self, id: Uuid) {
        let mut channels = self.channels.write().await;
        if let Some(tx) = channels.get(&id) {
            if tx.receiver_count() == 0 {
                channels.remove(&id);
            }
        }
    }

    /// Number of live channels (for tests and introspection).
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

/// Whether this event is the state change into a terminal state.
pub fn is_terminal_change(event: &TaskEvent) -> bool {
    matches!(event.kind, EventKind::StateChange { to, .. } if to.is_terminal())
}

/// Transition a task in the store and publish the recorded state-change
/// event to live observers, dropping the channel on terminal transitions.
///
/// This is the one path through which the broker and executor change state,
/// so the published order always matches the stored order.
pub async fn transition_and_publish(
    store: &dyn TaskStore,
    hub: &SignalHub,
    id: Uuid,
    new_state: TaskState,
    result: Option<String>,
    error: Option<String>,
) -> Result<Task, StoreError> {
    let task = store.update_state(id, new_state, result, error).await?;
    if let Some(event) = task.events.last() {
        hub.publish(event).await;
    }
    if new_state.is_terminal() {
        hub.remove(id).await;
    }
    Ok(task)
}

/// Append an event to the store and publish it to live observers.
pub async fn record_and_publish(
    store: &dyn TaskStore,
    hub: &SignalHub,
    id: Uuid,
    kind: EventKind,
    payload: String,
) -> Result<TaskEvent, StoreError> {
    let event = store.add_event(id, kind, payload).await?;
    hub.publish(&event).await;
    Ok(event)
}

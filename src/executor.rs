//! Executor — advances one claimed task to a terminal (or InputRequired) state.
//!
//! Stateless between invocations: everything durable lives in the store, so
//! any executor instance can pick up any claimed task.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::signals::{SignalHub, record_and_publish, transition_and_publish};
use crate::error::StoreError;
use crate::performer::{WorkContext, WorkOutcome, WorkPerformer, WorkReport};
use crate::store::TaskStore;
use crate::task::{EventKind, Task, TaskState};

/// Runs a single claimed task by invoking the work-performer and translating
/// its outcome into state transitions and events.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn TaskStore>,
    performer: Arc<dyn WorkPerformer>,
    signals: Arc<SignalHub>,
}

impl Executor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        performer: Arc<dyn WorkPerformer>,
        signals: Arc<SignalHub>,
    ) -> Self {
        Self {
            store,
            performer,
            signals,
        }
    }

    /// Run a task that has already been claimed (state Running).
    ///
    /// All performer errors are converted into a Failed transition here;
    /// only store failures propagate to the caller.
    pub async fn run(&self, task: Task, cancel: watch::Receiver<bool>) -> Result<(), StoreError> {
        let id = task.id;
        debug!(task_id = %id, "Executor starting");

        let (ctx, mut reports) = WorkContext::new(cancel);
        let invoke = self.performer.invoke(&task.input, &task.metadata, &ctx);
        tokio::pin!(invoke);

        // Forward progress/log reports live while the performer runs.
        let outcome = loop {
            tokio::select! {
                report = reports.recv() => {
                    if let Some(report) = report {
                        self.forward(id, report).await;
                    }
                }
                result = &mut invoke => break result,
            }
        };

        // Drain reports buffered before the performer returned.
        while let Ok(report) = reports.try_recv() {
            self.forward(id, report).await;
        }

        match outcome {
            Ok(WorkOutcome::Completed(result)) => {
                info!(task_id = %id, "Task completed");
                self.finish(id, TaskState::Completed, Some(result), None)
                    .await
            }
            Ok(WorkOutcome::NeedsInput(message)) => {
                info!(task_id = %id, "Task paused for input");
                if let Err(e) =
                    record_and_publish(&*self.store, &self.signals, id, EventKind::Log, message)
                        .await
                {
                    warn!(task_id = %id, error = %e, "Failed to record needs-input message");
                }
                self.finish(id, TaskState::InputRequired, None, None).await
            }
            Err(work_err) => {
                warn!(task_id = %id, error = %work_err, "Work-performer failed");
                self.finish(id, TaskState::Failed, None, Some(work_err.0))
                    .await
            }
        }
    }

    /// Record one progress/log report as a task event.
    async fn forward(&self, id: uuid::Uuid, report: WorkReport) {
        let (kind, payload) = match report {
            WorkReport::Progress(message) => (EventKind::Progress, message),
            WorkReport::Log(message) => (EventKind::Log, message),
        };
        if let Err(e) = record_and_publish(&*self.store, &self.signals, id, kind, payload).await {
            warn!(task_id = %id, error = %e, "Failed to record work report");
        }
    }

    /// Apply the final transition, treating a concurrent terminal state
    /// (cancellation race) as authoritative rather than an error.
    async fn finish(
        &self,
        id: uuid::Uuid,
        state: TaskState,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        match transition_and_publish(&*self.store, &self.signals, id, state, result, error).await {
            Ok(_) => Ok(()),
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                info!(task_id = %id, outcome = %state, terminal = %from, "Outcome discarded; task already terminal");
                let _ = record_and_publish(
                    &*self.store,
                    &self.signals,
                    id,
                    EventKind::Log,
                    format!("{state} outcome discarded; task already {from}"),
                )
                .await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::performer::WorkError;
    use crate::store::MemoryStore;

    /// Performer scripted by the task input.
    struct ScriptedPerformer;

    #[async_trait]
    impl WorkPerformer for ScriptedPerformer {
        async fn invoke(
            &self,
            input: &str,
            _metadata: &serde_json::Value,
            ctx: &WorkContext,
        ) -> Result<WorkOutcome, WorkError> {
            match input {
                "2+2" => {
                    ctx.progress("evaluating");
                    ctx.log("arithmetic mode");
                    Ok(WorkOutcome::Completed("4".into()))
                }
                "ask" => Ok(WorkOutcome::NeedsInput("which base?".into())),
                other => Err(WorkError::new(format!("invalid input: {other}"))),
            }
        }
    }

    async fn run_one(input: &str) -> (Arc<MemoryStore>, Task) {
        let store = Arc::new(MemoryStore::new());
        let signals = Arc::new(SignalHub::new(16));
        let executor = Executor::new(store.clone(), Arc::new(ScriptedPerformer), signals);

        let task = store.create(Task::new(input, None)).await.unwrap();
        let claimed = store.next_pending().await.unwrap().unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        executor.run(claimed, cancel_rx).await.unwrap();

        let snapshot = store.get(task.id).await.unwrap().unwrap();
        (store, snapshot)
    }

    #[tokio::test]
    async fn success_sets_result_and_events() {
        let (_store, task) = run_one("2+2").await;
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result.as_deref(), Some("4"));
        assert!(task.error.is_none());

        // claim, progress, log, terminal state change — in order.
        let kinds: Vec<_> = task.events.iter().map(|e| &e.kind).collect();
        assert_eq!(kinds.len(), 4);
        assert!(matches!(kinds[1], EventKind::Progress));
        assert!(matches!(kinds[2], EventKind::Log));
        assert!(matches!(
            kinds[3],
            EventKind::StateChange {
                to: TaskState::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn failure_preserves_error_message() {
        let (_store, task) = run_one("boom").await;
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error.as_deref(), Some("invalid input: boom"));
        assert!(task.result.is_none());
    }

    #[tokio::test]
    async fn needs_input_pauses_task() {
        let (_store, task) = run_one("ask").await;
        assert_eq!(task.state, TaskState::InputRequired);
        assert!(task.result.is_none());
        assert!(task.error.is_none());
        assert!(task.events.iter().any(
            |e| matches!(e.kind, EventKind::Log) && e.payload == "which base?"
        ));
    }

    #[tokio::test]
    async fn late_result_discarded_after_cancellation() {
        let store = Arc::new(MemoryStore::new());
        let signals = Arc::new(SignalHub::new(16));
        let executor = Executor::new(store.clone(), Arc::new(ScriptedPerformer), signals);

        let task = store.create(Task::new("2+2", None)).await.unwrap();
        let claimed = store.next_pending().await.unwrap().unwrap();
        // Cancel between claim and execution.
        store
            .update_state(task.id, TaskState::Cancelled, None, None)
            .await
            .unwrap();

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        executor.run(claimed, cancel_rx).await.unwrap();

        let snapshot = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(snapshot.state, TaskState::Cancelled);
        assert!(snapshot.result.is_none());
    }
}

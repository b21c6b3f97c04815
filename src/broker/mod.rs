//! Broker — the coordination hub between submitters and executors.
//!
//! Owns the dispatch loop and all observation primitives (poll, wait,
//! stream, notify) plus cancellation and explicit resume. Explicitly
//! constructed and scoped: the owner controls `start` and `shutdown`, and
//! anything that needs to submit or observe tasks is handed a reference.

pub mod dispatch;
pub mod signals;

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, Semaphore, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::signals::{
    SignalHub, is_terminal_change, record_and_publish, transition_and_publish,
};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Error, Result, StoreError};
use crate::performer::WorkPerformer;
use crate::store::TaskStore;
use crate::task::{EventKind, Task, TaskEvent, TaskState};

/// A task currently held by a live executor.
pub(crate) struct RunningTask {
    pub(crate) cancel_tx: watch::Sender<bool>,
    pub(crate) handle: JoinHandle<()>,
    /// Registration token; an executor only deregisters its own entry, so a
    /// resume that re-registers the task id is never unregistered by the
    /// previous executor's cleanup.
    pub(crate) generation: u64,
}

/// State shared between the broker handle and its background loops.
pub(crate) struct BrokerInner {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) performer: Arc<dyn WorkPerformer>,
    pub(crate) config: BrokerConfig,
    pub(crate) signals: Arc<SignalHub>,
    pub(crate) running: RwLock<HashMap<Uuid, RunningTask>>,
    pub(crate) run_generation: AtomicU64,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
}

/// Accepts submissions, dispatches work, and serves all observation queries.
pub struct Broker {
    inner: Arc<BrokerInner>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// Create a broker over the given store and work-performer. Background
    /// loops are not running until [`start`](Self::start) is called.
    pub fn new(
        store: Arc<dyn TaskStore>,
        performer: Arc<dyn WorkPerformer>,
        config: BrokerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let signals = Arc::new(SignalHub::new(config.event_channel_capacity));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            inner: Arc::new(BrokerInner {
                store,
                performer,
                config,
                signals,
                running: RwLock::new(HashMap::new()),
                run_generation: AtomicU64::new(0),
                semaphore,
                shutdown_tx,
            }),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Start the dispatch loop and recovery sweep. Idempotent.
    pub async fn start(&self) {
        let mut loops = self.loops.lock().await;
        if !loops.is_empty() {
            return;
        }
        loops.push(tokio::spawn(dispatch::dispatch_loop(Arc::clone(
            &self.inner,
        ))));
        loops.push(tokio::spawn(dispatch::recovery_sweep(Arc::clone(
            &self.inner,
        ))));
        info!("Broker started");
    }

    /// Stop claiming new work and drain running executors.
    ///
    /// Executors that outlast the drain timeout are cooperatively cancelled
    /// and then aborted; their tasks stay Running in the store and are
    /// re-queued by the recovery sweep after a restart.
    pub async fn shutdown(&self) {
        // send_replace stores the value even while no loop has subscribed
        // yet, so a shutdown racing loop startup is never lost.
        self.inner.shutdown_tx.send_replace(true);

        let mut loops = self.loops.lock().await;
        for handle in loops.drain(..) {
            let _ = handle.await;
        }
        drop(loops);

        let entries: Vec<(Uuid, RunningTask)> =
            self.inner.running.write().await.drain().collect();
        let deadline = tokio::time::Instant::now() + self.inner.config.drain_timeout;
        for (id, task) in entries {
            let abort = task.handle.abort_handle();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, task.handle).await.is_err() {
                warn!(task_id = %id, "Executor did not drain in time; cancelling");
                let _ = task.cancel_tx.send(true);
                abort.abort();
            }
        }
        info!("Broker stopped");
    }

    /// Create a new Pending task and return its id immediately.
    pub async fn submit(
        &self,
        input: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Uuid> {
        if *self.inner.shutdown_tx.borrow() {
            return Err(BrokerError::ShuttingDown.into());
        }
        let task = self.inner.store.create(Task::new(input, metadata)).await?;
        record_and_publish(
            &*self.inner.store,
            &self.inner.signals,
            task.id,
            EventKind::Log,
            "task submitted".into(),
        )
        .await?;
        info!(task_id = %task.id, "Task submitted");
        Ok(task.id)
    }

    /// Current task snapshot, including the full event log.
    pub async fn poll(&self, id: Uuid) -> Result<Task> {
        get_required(&self.inner, id).await
    }

    /// Suspend until the task reaches a terminal state, or the timeout
    /// elapses. A timeout never affects the task itself.
    pub async fn wait(&self, id: Uuid, timeout: Option<Duration>) -> Result<Task> {
        match timeout {
            Some(duration) => {
                match tokio::time::timeout(duration, wait_terminal(&self.inner, id)).await {
                    Ok(result) => result,
                    Err(_) => {
                        // The waiter (and its receiver) was dropped by the
                        // timeout; drop the channel too if it was the last.
                        self.inner.signals.prune(id).await;
                        Err(BrokerError::WaitTimeout {
                            id,
                            timeout: duration,
                        }
                        .into())
                    }
                }
            }
            None => wait_terminal(&self.inner, id).await,
        }
    }

    /// Ordered event stream: full history first, then live events, ending
    /// after the state change into a terminal state has been delivered.
    ///
    /// Every concurrent stream sees the same strictly seq-ordered view; a
    /// lagging consumer is caught up from the store instead of losing events.
    pub async fn stream(&self, id: Uuid) -> Result<ReceiverStream<TaskEvent>> {
        // Surface NotFound to the caller, not into the stream.
        let _ = get_required(&self.inner, id).await?;

        let (tx, rx) = mpsc::channel(self.inner.config.event_channel_capacity);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(pump_events(inner, id, tx));
        Ok(ReceiverStream::new(rx))
    }

    /// Register a callback fired exactly once when the task reaches one of
    /// `on_states`. Fires immediately if the task is already terminal;
    /// executes asynchronously and never blocks the triggering executor.
    pub async fn notify<F>(&self, id: Uuid, on_states: Vec<TaskState>, callback: F) -> Result<()>
    where
        F: FnOnce(Task) + Send + 'static,
    {
        let snapshot = get_required(&self.inner, id).await?;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let task = if snapshot.state.is_terminal() {
                snapshot
            } else {
                match wait_terminal(&inner, id).await {
                    Ok(task) => task,
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "Notify registration abandoned");
                        return;
                    }
                }
            };
            if on_states.contains(&task.state) {
                callback(task);
            }
        });
        Ok(())
    }

    /// Request cancellation.
    ///
    /// Pending and InputRequired tasks go straight to Cancelled. Running
    /// tasks are signalled to stop at their next checkpoint, with Cancelled
    /// recorded promptly. Cancelling an already-terminal task returns its
    /// snapshot unchanged.
    pub async fn cancel(&self, id: Uuid) -> Result<Task> {
        let snapshot = get_required(&self.inner, id).await?;
        if snapshot.state.is_terminal() {
            return Ok(snapshot);
        }

        if snapshot.state == TaskState::Running {
            if let Some(running) = self.inner.running.read().await.get(&id) {
                let _ = running.cancel_tx.send(true);
            }
            let _ = record_and_publish(
                &*self.inner.store,
                &self.inner.signals,
                id,
                EventKind::Log,
                "cancellation requested; executor will stop at its next checkpoint".into(),
            )
            .await;
        }

        match transition_and_publish(
            &*self.inner.store,
            &self.inner.signals,
            id,
            TaskState::Cancelled,
            None,
            None,
        )
        .await
        {
            Ok(task) => {
                info!(task_id = %id, "Task cancelled");
                Ok(task)
            }
            // Raced with a terminal transition; the store wins.
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                get_required(&self.inner, id).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resume a task paused in InputRequired — an explicit caller action,
    /// symmetrical with `submit`. The supplied input, if any, replaces the
    /// task's payload before it is handed back to an executor.
    pub async fn resume(&self, id: Uuid, input: Option<String>) -> Result<Task> {
        if *self.inner.shutdown_tx.borrow() {
            return Err(BrokerError::ShuttingDown.into());
        }
        // Only paused tasks may resume; everything else keeps its input and
        // its place in the queue.
        let snapshot = get_required(&self.inner, id).await?;
        if snapshot.state != TaskState::InputRequired {
            return Err(StoreError::InvalidTransition {
                id,
                from: snapshot.state,
                to: TaskState::Running,
            }
            .into());
        }
        if let Some(input) = input {
            self.inner.store.set_input(id, input).await?;
        }
        let task = transition_and_publish(
            &*self.inner.store,
            &self.inner.signals,
            id,
            TaskState::Running,
            None,
            None,
        )
        .await?;
        info!(task_id = %id, "Task resumed");
        dispatch::spawn_executor(&self.inner, task.clone(), None).await;
        Ok(task)
    }
}

/// `get` that converts absence into `NotFound`.
async fn get_required(inner: &Arc<BrokerInner>, id: Uuid) -> Result<Task> {
    inner
        .store
        .get(id)
        .await?
        .ok_or_else(|| Error::Store(StoreError::NotFound { id }))
}

/// Suspend until the task is terminal, waking on the per-task signal rather
/// than polling. Prunes the signal channel once done.
async fn wait_terminal(inner: &Arc<BrokerInner>, id: Uuid) -> Result<Task> {
    // Subscribe before the snapshot read so no transition is missed.
    let rx = inner.signals.subscribe(id).await;
    let result = wait_terminal_on(inner, id, rx).await;
    inner.signals.prune(id).await;
    result
}

async fn wait_terminal_on(
    inner: &Arc<BrokerInner>,
    id: Uuid,
    mut rx: broadcast::Receiver<TaskEvent>,
) -> Result<Task> {
    let snapshot = get_required(inner, id).await?;
    if snapshot.state.is_terminal() {
        return Ok(snapshot);
    }

    loop {
        match rx.recv().await {
            Ok(event) => {
                if is_terminal_change(&event) {
                    return get_required(inner, id).await;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_))
            | Err(broadcast::error::RecvError::Closed) => {
                // Missed events or a pruned channel; the snapshot decides.
                let snapshot = get_required(inner, id).await?;
                if snapshot.state.is_terminal() {
                    return Ok(snapshot);
                }
                rx = inner.signals.subscribe(id).await;
                let snapshot = get_required(inner, id).await?;
                if snapshot.state.is_terminal() {
                    return Ok(snapshot);
                }
            }
        }
    }
}

/// Feed one stream subscriber: stored history first, then live events,
/// strictly in seq order, terminating on the terminal state change.
async fn pump_events(inner: Arc<BrokerInner>, id: Uuid, tx: mpsc::Sender<TaskEvent>) {
    // Subscribe before reading history so nothing falls between the two.
    let live = inner.signals.subscribe(id).await;
    pump_events_on(&inner, id, live, tx).await;
    inner.signals.prune(id).await;
}

async fn pump_events_on(
    inner: &Arc<BrokerInner>,
    id: Uuid,
    mut live: broadcast::Receiver<TaskEvent>,
    tx: mpsc::Sender<TaskEvent>,
) {
    let mut last_seq = 0u64;

    if catch_up(inner, id, &mut last_seq, &tx).await.is_break() {
        return;
    }

    loop {
        // Stop pumping as soon as the subscriber drops the stream, even if
        // no event ever arrives.
        let received = tokio::select! {
            received = live.recv() => received,
            _ = tx.closed() => return,
        };
        match received {
            Ok(event) => {
                if event.seq <= last_seq {
                    continue;
                }
                if event.seq == last_seq + 1 {
                    last_seq = event.seq;
                    let terminal = is_terminal_change(&event);
                    if tx.send(event).await.is_err() || terminal {
                        return;
                    }
                } else {
                    // Gap between broadcast and log; re-read from the store.
                    if catch_up(inner, id, &mut last_seq, &tx).await.is_break() {
                        return;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                if catch_up(inner, id, &mut last_seq, &tx).await.is_break() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                if catch_up(inner, id, &mut last_seq, &tx).await.is_break() {
                    return;
                }
                // Closed without a terminal event delivered: either the task
                // is terminal (log already drained above) or the channel was
                // pruned early — re-check and resubscribe.
                match inner.store.get(id).await {
                    Ok(Some(task)) if !task.state.is_terminal() => {
                        live = inner.signals.subscribe(id).await;
                    }
                    _ => return,
                }
            }
        }
    }
}

/// Send every stored event after `last_seq`. Breaks when the subscriber is
/// gone, a terminal event was delivered, or the store failed.
async fn catch_up(
    inner: &Arc<BrokerInner>,
    id: Uuid,
    last_seq: &mut u64,
    tx: &mpsc::Sender<TaskEvent>,
) -> ControlFlow<()> {
    match inner.store.events_since(id, *last_seq).await {
        Ok(events) => {
            for event in events {
                *last_seq = event.seq;
                let terminal = is_terminal_change(&event);
                if tx.send(event).await.is_err() || terminal {
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        }
        Err(e) => {
            warn!(task_id = %id, error = %e, "Stream catch-up failed");
            ControlFlow::Break(())
        }
    }
}

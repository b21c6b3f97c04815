//! Dispatch loop and recovery sweep.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::signals::{record_and_publish, transition_and_publish};
use crate::broker::{BrokerInner, RunningTask};
use crate::error::StoreError;
use crate::executor::Executor;
use crate::task::{EventKind, Task, TaskState};

/// Repeatedly claim pending tasks and hand each to an executor, with bounded
/// backoff while idle. Executor failures never crash the loop.
pub(crate) async fn dispatch_loop(inner: Arc<BrokerInner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut backoff = inner.config.poll_backoff_min;
    info!("Dispatch loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Bound concurrency before claiming, so a claimed task never sits
        // waiting for a worker slot.
        let permit = tokio::select! {
            permit = inner.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        match inner.store.next_pending().await {
            Ok(Some(task)) => {
                backoff = inner.config.poll_backoff_min;
                // The claim appended a StateChange event; surface it live.
                if let Some(event) = task.events.last() {
                    inner.signals.publish(event).await;
                }
                debug!(task_id = %task.id, "Task claimed");
                spawn_executor(&inner, task, Some(permit)).await;
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => break,
                }
                backoff = (backoff * 2).min(inner.config.poll_backoff_max);
            }
            Err(e) => {
                drop(permit);
                // A store failure blocks all tasks, not just one.
                error!(error = %e, "Store failure in dispatch loop; broker availability degraded");
                tokio::select! {
                    _ = tokio::time::sleep(inner.config.poll_backoff_max) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    info!("Dispatch loop stopped");
}

/// Run one claimed task on a fresh executor task, registered for
/// cancellation and shutdown draining.
pub(crate) async fn spawn_executor(
    inner: &Arc<BrokerInner>,
    task: Task,
    permit: Option<OwnedSemaphorePermit>,
) {
    let id = task.id;
    let generation = inner.run_generation.fetch_add(1, Ordering::Relaxed);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let executor = Executor::new(
        Arc::clone(&inner.store),
        Arc::clone(&inner.performer),
        Arc::clone(&inner.signals),
    );
    let inner2 = Arc::clone(inner);

    // Hold the registry lock across the spawn so the executor task cannot
    // deregister before it is registered.
    let mut running = inner.running.write().await;
    let handle = tokio::spawn(async move {
        let _permit = match permit {
            Some(permit) => Some(permit),
            None => inner2.semaphore.clone().acquire_owned().await.ok(),
        };

        match AssertUnwindSafe(executor.run(task, cancel_rx))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(task_id = %id, error = %e, "Executor store failure");
            }
            Err(_) => {
                warn!(task_id = %id, "Executor panicked; marking task failed");
                match transition_and_publish(
                    &*inner2.store,
                    &inner2.signals,
                    id,
                    TaskState::Failed,
                    None,
                    Some("executor panicked".into()),
                )
                .await
                {
                    Ok(_) | Err(StoreError::InvalidTransition { .. }) => {}
                    Err(e) => {
                        error!(task_id = %id, error = %e, "Failed to record executor panic");
                    }
                }
            }
        }

        // Deregister only this executor's own registration; a resume may
        // already have re-registered the id with a newer generation.
        let mut running = inner2.running.write().await;
        if running.get(&id).is_some_and(|t| t.generation == generation) {
            running.remove(&id);
        }
    });
    running.insert(
        id,
        RunningTask {
            cancel_tx,
            handle,
            generation,
        },
    );
}

/// Periodically re-queue Running tasks whose heartbeat went stale, so a task
/// orphaned by a crashed executor does not stay Running forever.
pub(crate) async fn recovery_sweep(inner: Arc<BrokerInner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut ticker = tokio::time::interval(inner.config.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval fires immediately; skip the first tick.
    ticker.tick().await;

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let exclude: Vec<Uuid> = inner.running.read().await.keys().copied().collect();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(inner.config.stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        match inner.store.requeue_stale(cutoff, &exclude).await {
            Ok(requeued) => {
                for task in requeued {
                    warn!(task_id = %task.id, "Re-queued stale running task");
                    if let Some(event) = task.events.last() {
                        inner.signals.publish(event).await;
                    }
                    let _ = record_and_publish(
                        &*inner.store,
                        &inner.signals,
                        task.id,
                        EventKind::Log,
                        "re-queued after staleness threshold".into(),
                    )
                    .await;
                }
            }
            Err(e) => {
                error!(error = %e, "Recovery sweep store failure");
            }
        }
    }
}

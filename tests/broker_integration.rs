//! Integration tests for the broker lifecycle.
//!
//! Each test wires a real broker over a real store with a scripted stub
//! work-performer (no external engine) and exercises the full
//! submit/dispatch/observe contract.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use uuid::Uuid;

use taskbroker::broker::Broker;
use taskbroker::config::BrokerConfig;
use taskbroker::error::{BrokerError, Error};
use taskbroker::performer::{WorkContext, WorkError, WorkOutcome, WorkPerformer};
use taskbroker::store::{LibSqlStore, MemoryStore, TaskStore};
use taskbroker::task::{EventKind, Task, TaskState};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Stub work-performer scripted by the task input (no real engine).
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
            "2+2" => Ok(WorkOutcome::Completed("4".into())),
            "progress" => {
                ctx.progress("step 1");
                ctx.progress("step 2");
                ctx.log("halfway");
                tokio::time::sleep(Duration::from_millis(10)).await;
                ctx.progress("step 3");
                Ok(WorkOutcome::Completed("done".into()))
            }
            "ask" => Ok(WorkOutcome::NeedsInput("need a second operand".into())),
            "resume-answer" => Ok(WorkOutcome::Completed("answered".into())),
            "slow" => {
                // Checkpointed long-running work.
                for _ in 0..500 {
                    if ctx.is_cancelled() {
                        return Err(WorkError::new("stopped at cancellation checkpoint"));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(WorkOutcome::Completed("slow done".into()))
            }
            "fail" => Err(WorkError::new("invalid input")),
            other => Err(WorkError::new(format!("unknown script: {other}"))),
        }
    }
}

/// Fast timings so the dispatch loop and sweep react within test budgets.
fn test_config() -> BrokerConfig {
    BrokerConfig {
        poll_backoff_min: Duration::from_millis(5),
        poll_backoff_max: Duration::from_millis(20),
        stale_after: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(50),
        drain_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn make_broker() -> (Arc<MemoryStore>, Broker) {
    // Surface broker logs when a test is run with RUST_LOG set.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let store = Arc::new(MemoryStore::new());
    let broker = Broker::new(store.clone(), Arc::new(ScriptedPerformer), test_config());
    (store, broker)
}

/// Poll until the task reaches the given state (tests only; the broker's own
/// `wait` is for terminal states).
async fn wait_for_state(broker: &Broker, id: Uuid, state: TaskState) -> Task {
    loop {
        let task = broker.poll(id).await.unwrap();
        if task.state == state {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn claim_count(task: &Task) -> usize {
    task.events
        .iter()
        .filter(|e| {
            matches!(
                e.kind,
                EventKind::StateChange {
                    from: TaskState::Pending,
                    to: TaskState::Running,
                }
            )
        })
        .count()
}

// ── Round trip ───────────────────────────────────────────────────────

#[tokio::test]
async fn round_trip_submit_wait_poll() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let id = broker.submit("2+2", None).await.unwrap();
        let done = broker.wait(id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.result.as_deref(), Some("4"));
        assert!(done.error.is_none());

        // Idempotent reads: a second poll returns the identical snapshot.
        let first = broker.poll(id).await.unwrap();
        let second = broker.poll(id).await.unwrap();
        assert_eq!(first.state, second.state);
        assert_eq!(first.result, second.result);
        assert_eq!(first.events.len(), second.events.len());

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn metadata_reaches_the_performer() {
    // Performer keyed off metadata rather than input.
    struct MetaPerformer;

    #[async_trait]
    impl WorkPerformer for MetaPerformer {
        async fn invoke(
            &self,
            _input: &str,
            metadata: &serde_json::Value,
            _ctx: &WorkContext,
        ) -> Result<WorkOutcome, WorkError> {
            Ok(WorkOutcome::Completed(
                metadata["profile"].as_str().unwrap_or("missing").to_string(),
            ))
        }
    }

    timeout(TEST_TIMEOUT, async {
        let store = Arc::new(MemoryStore::new());
        let broker = Broker::new(store, Arc::new(MetaPerformer), test_config());
        broker.start().await;

        let id = broker
            .submit("anything", Some(serde_json::json!({"profile": "fast"})))
            .await
            .unwrap();
        let done = broker.wait(id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(done.result.as_deref(), Some("fast"));

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

// ── Failure path ─────────────────────────────────────────────────────

#[tokio::test]
async fn failure_preserves_error_message() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let id = broker.submit("fail", None).await.unwrap();
        let done = broker.wait(id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(done.state, TaskState::Failed);
        assert_eq!(done.error.as_deref(), Some("invalid input"));
        assert!(done.result.is_none());

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        let err = broker.poll(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Store(taskbroker::error::StoreError::NotFound { .. })
        ));
    })
    .await
    .expect("test timed out");
}

// ── Cancellation ─────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_before_dispatch_is_never_claimed() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        // Broker not started: the task sits Pending.
        let id = broker.submit("2+2", None).await.unwrap();
        let cancelled = broker.cancel(id).await.unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);

        broker.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let task = broker.poll(id).await.unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert_eq!(claim_count(&task), 0, "dispatch loop must never claim it");

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_while_running_records_promptly() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let id = broker.submit("slow", None).await.unwrap();
        wait_for_state(&broker, id, TaskState::Running).await;

        let cancelled = broker.cancel(id).await.unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);

        // The performer drains at its next checkpoint; its late outcome is
        // discarded and the terminal state stays Cancelled.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let task = broker.poll(id).await.unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert!(task.result.is_none());
        assert!(task.error.is_none());

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_after_terminal_returns_snapshot() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let id = broker.submit("2+2", None).await.unwrap();
        broker.wait(id, Some(Duration::from_secs(5))).await.unwrap();

        let snapshot = broker.cancel(id).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Completed);
        assert_eq!(snapshot.result.as_deref(), Some("4"));

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

// ── wait ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn wait_on_terminal_task_returns_immediately() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let id = broker.submit("2+2", None).await.unwrap();
        broker.wait(id, Some(Duration::from_secs(5))).await.unwrap();

        // Already terminal: even a tiny timeout must succeed.
        let again = broker
            .wait(id, Some(Duration::from_millis(1)))
            .await
            .unwrap();
        assert_eq!(again.state, TaskState::Completed);

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn wait_timeout_does_not_cancel_the_task() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        // Broker not started: the task never completes.
        let id = broker.submit("2+2", None).await.unwrap();

        let err = broker
            .wait(id, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Broker(BrokerError::WaitTimeout { .. })
        ));

        // Observation timed out; the task itself is untouched.
        let task = broker.poll(id).await.unwrap();
        assert_eq!(task.state, TaskState::Pending);
    })
    .await
    .expect("test timed out");
}

// ── stream ───────────────────────────────────────────────────────────

#[tokio::test]
async fn stream_delivers_full_ordered_log_to_each_observer() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();

        let id = broker.submit("progress", None).await.unwrap();
        let mut stream_a = broker.stream(id).await.unwrap();
        let mut stream_b = broker.stream(id).await.unwrap();
        broker.start().await;

        let mut seen_a = Vec::new();
        while let Some(event) = stream_a.next().await {
            seen_a.push(event);
        }
        let mut seen_b = Vec::new();
        while let Some(event) = stream_b.next().await {
            seen_b.push(event);
        }

        // Strictly ordered, gap-free, ending at the terminal transition.
        let seqs: Vec<u64> = seen_a.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
        assert!(matches!(
            seen_a.last().unwrap().kind,
            EventKind::StateChange {
                to: TaskState::Completed,
                ..
            }
        ));
        assert!(
            seen_a
                .iter()
                .any(|e| e.kind == EventKind::Progress && e.payload == "step 2")
        );

        // Identical to the stored log and to the other observer.
        let task = broker.poll(id).await.unwrap();
        assert_eq!(seen_a.len(), task.events.len());
        assert_eq!(seen_a.len(), seen_b.len());
        for (a, b) in seen_a.iter().zip(seen_b.iter()) {
            assert_eq!(a.seq, b.seq);
            assert_eq!(a.kind, b.kind);
            assert_eq!(a.payload, b.payload);
        }

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn late_stream_replays_history_of_terminal_task() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let id = broker.submit("progress", None).await.unwrap();
        broker.wait(id, Some(Duration::from_secs(5))).await.unwrap();

        // Subscribe after the fact: full history, then immediate end.
        let mut stream = broker.stream(id).await.unwrap();
        let mut seen = Vec::new();
        while let Some(event) = stream.next().await {
            seen.push(event);
        }
        let task = broker.poll(id).await.unwrap();
        assert_eq!(seen.len(), task.events.len());

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

// ── notify ───────────────────────────────────────────────────────────

#[tokio::test]
async fn notify_fires_exactly_once() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let fired = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let id = broker.submit("2+2", None).await.unwrap();
        let fired2 = fired.clone();
        broker
            .notify(id, vec![TaskState::Completed], move |task| {
                fired2.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(task);
            })
            .await
            .unwrap();

        let task = done_rx.await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.result.as_deref(), Some("4"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn notify_on_already_terminal_task_fires_immediately() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let id = broker.submit("2+2", None).await.unwrap();
        broker.wait(id, Some(Duration::from_secs(5))).await.unwrap();

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        broker
            .notify(id, vec![TaskState::Completed], move |task| {
                let _ = done_tx.send(task.state);
            })
            .await
            .unwrap();

        let state = done_rx.await.unwrap();
        assert_eq!(state, TaskState::Completed);

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn notify_skips_non_matching_terminal_state() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let fired = Arc::new(AtomicUsize::new(0));
        let id = broker.submit("fail", None).await.unwrap();
        let fired2 = fired.clone();
        broker
            .notify(id, vec![TaskState::Completed], move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        broker.wait(id, Some(Duration::from_secs(5))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

// ── Exactly-once dispatch ────────────────────────────────────────────

#[tokio::test]
async fn many_tasks_each_claimed_exactly_once() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let mut ids = Vec::new();
        for _ in 0..25 {
            ids.push(broker.submit("2+2", None).await.unwrap());
        }

        for id in &ids {
            let done = broker.wait(*id, Some(Duration::from_secs(5))).await.unwrap();
            assert_eq!(done.state, TaskState::Completed);
            assert_eq!(claim_count(&done), 1, "task {id} claimed more than once");
        }

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

// ── INPUT_REQUIRED / resume ──────────────────────────────────────────

#[tokio::test]
async fn paused_task_resumes_on_explicit_call() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let id = broker.submit("ask", None).await.unwrap();
        let paused = wait_for_state(&broker, id, TaskState::InputRequired).await;
        assert!(
            paused
                .events
                .iter()
                .any(|e| e.kind == EventKind::Log && e.payload == "need a second operand")
        );

        // Paused work is not re-claimed automatically.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            broker.poll(id).await.unwrap().state,
            TaskState::InputRequired
        );

        broker
            .resume(id, Some("resume-answer".into()))
            .await
            .unwrap();
        let done = broker.wait(id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.result.as_deref(), Some("answered"));

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn resume_on_pending_task_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        // Broker not started: the task sits Pending in the queue.
        let id = broker.submit("2+2", None).await.unwrap();

        let err = broker.resume(id, Some("replaced".into())).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Store(taskbroker::error::StoreError::InvalidTransition {
                from: TaskState::Pending,
                ..
            })
        ));

        // Still queued, input untouched.
        let task = broker.poll(id).await.unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.input, "2+2");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failed_resume_keeps_the_input() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let id = broker.submit("slow", None).await.unwrap();
        wait_for_state(&broker, id, TaskState::Running).await;

        let err = broker.resume(id, Some("hijacked".into())).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Store(taskbroker::error::StoreError::InvalidTransition {
                from: TaskState::Running,
                ..
            })
        ));
        assert_eq!(broker.poll(id).await.unwrap().input, "slow");

        broker.cancel(id).await.unwrap();
        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn resumed_task_stays_tracked_by_the_broker() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let id = broker.submit("ask", None).await.unwrap();
        wait_for_state(&broker, id, TaskState::InputRequired).await;
        broker.resume(id, Some("slow".into())).await.unwrap();
        wait_for_state(&broker, id, TaskState::Running).await;

        // Well past stale_after with no heartbeat: the sweep must skip a
        // task its own live executor still holds.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let task = broker.poll(id).await.unwrap();
        assert_eq!(task.state, TaskState::Running);
        assert!(!task.events.iter().any(|e| matches!(
            e.kind,
            EventKind::StateChange {
                from: TaskState::Running,
                to: TaskState::Pending,
            }
        )));

        // And the cooperative cancel flag still reaches the executor.
        let cancelled = broker.cancel(id).await.unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let task = broker.poll(id).await.unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert!(task.error.is_none());

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn paused_task_can_be_cancelled() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let id = broker.submit("ask", None).await.unwrap();
        wait_for_state(&broker, id, TaskState::InputRequired).await;

        let cancelled = broker.cancel(id).await.unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

// ── Restart recovery ─────────────────────────────────────────────────

#[tokio::test]
async fn stale_running_task_is_requeued_and_finishes() {
    timeout(TEST_TIMEOUT, async {
        let store = Arc::new(MemoryStore::new());

        // Simulate an executor crash: claim directly against the store so no
        // live executor is tracked, leaving the task stuck Running.
        let task = store.create(Task::new("2+2", None)).await.unwrap();
        store.next_pending().await.unwrap().unwrap();

        let broker = Broker::new(store.clone(), Arc::new(ScriptedPerformer), test_config());
        broker.start().await;

        let done = broker
            .wait(task.id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.result.as_deref(), Some("4"));

        // The sweep recorded the re-queue before the second claim.
        assert!(done.events.iter().any(|e| matches!(
            e.kind,
            EventKind::StateChange {
                from: TaskState::Running,
                to: TaskState::Pending,
            }
        )));
        assert_eq!(claim_count(&done), 2);

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

// ── Shutdown ─────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_rejects_new_submissions() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;
        broker.shutdown().await;

        let err = broker.submit("2+2", None).await.unwrap_err();
        assert!(matches!(err, Error::Broker(BrokerError::ShuttingDown)));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shutdown_drains_in_flight_work() {
    timeout(TEST_TIMEOUT, async {
        let (_store, broker) = make_broker();
        broker.start().await;

        let id = broker.submit("progress", None).await.unwrap();
        wait_for_state(&broker, id, TaskState::Running).await;
        broker.shutdown().await;

        let task = broker.poll(id).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
    })
    .await
    .expect("test timed out");
}

// ── Durable backend ──────────────────────────────────────────────────

#[tokio::test]
async fn broker_over_libsql_round_trip() {
    timeout(TEST_TIMEOUT, async {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let broker = Broker::new(store, Arc::new(ScriptedPerformer), test_config());
        broker.start().await;

        let id = broker.submit("2+2", None).await.unwrap();
        let done = broker.wait(id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.result.as_deref(), Some("4"));

        broker.shutdown().await;
    })
    .await
    .expect("test timed out");
}

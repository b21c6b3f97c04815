//! libSQL backend — durable async `TaskStore` implementation.
//!
//! Tasks survive process restarts. The claim primitive is a conditional
//! `UPDATE ... WHERE state = 'pending'`; the seq counter is assigned inside
//! the insert statement, so both stay atomic under concurrent callers.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::traits::TaskStore;
use crate::task::{EventKind, Task, TaskEvent, TaskState};

const TASK_COLUMNS: &str = "id, state, input, result, error, metadata, created_at, updated_at";

/// libSQL task store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and initialize the schema.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("Failed to create store directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Backend(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Task store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Backend(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    input TEXT NOT NULL,
                    result TEXT,
                    error TEXT,
                    metadata TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);

                CREATE TABLE IF NOT EXISTS task_events (
                    task_id TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (task_id, seq)
                );",
            )
            .await
            .map_err(|e| StoreError::Backend(format!("init_schema: {e}")))?;
        Ok(())
    }

    /// Load a task row (without events), or `None`.
    async fn get_row(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("get task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Backend(format!("get task: {e}"))),
        }
    }

    /// Load a task snapshot with its full event log.
    async fn load_task(&self, id: Uuid) -> Result<Task, StoreError> {
        let mut task = self
            .get_row(id)
            .await?
            .ok_or(StoreError::NotFound { id })?;
        task.events = self.events_since(id, 0).await?;
        Ok(task)
    }

    /// Append an event row, assigning the next per-task seq.
    async fn insert_event(
        &self,
        id: Uuid,
        kind: &EventKind,
        payload: &str,
    ) -> Result<TaskEvent, StoreError> {
        let now = Utc::now();
        let kind_json = serde_json::to_string(kind)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut rows = self
            .conn()
            .query(
                "INSERT INTO task_events (task_id, seq, kind, payload, created_at)
                 VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM task_events WHERE task_id = ?1), ?2, ?3, ?4)
                 RETURNING seq",
                params![id.to_string(), kind_json, payload, now.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("insert event: {e}")))?;

        let seq: i64 = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| StoreError::Backend(format!("insert event seq: {e}")))?,
            Ok(None) => return Err(StoreError::Backend("insert event returned no seq".into())),
            Err(e) => return Err(StoreError::Backend(format!("insert event: {e}"))),
        };

        self.conn()
            .execute(
                "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("heartbeat: {e}")))?;

        Ok(TaskEvent {
            task_id: id,
            seq: seq as u64,
            kind: kind.clone(),
            payload: payload.to_string(),
            timestamp: now,
        })
    }

    /// Conditional state update: succeeds only if the row is still in `from`.
    ///
    /// Returns false when another caller transitioned the task first.
    async fn try_transition(
        &self,
        id: Uuid,
        from: TaskState,
        to: TaskState,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        let (result_val, error_val) = match to {
            TaskState::Completed => (opt_text(&result), libsql::Value::Null),
            TaskState::Failed => (libsql::Value::Null, opt_text(&error)),
            _ => (libsql::Value::Null, libsql::Value::Null),
        };

        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET state = ?1, result = ?2, error = ?3, updated_at = ?4
                 WHERE id = ?5 AND state = ?6",
                params![
                    to.to_string(),
                    result_val,
                    error_val,
                    now,
                    id.to_string(),
                    from.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("update state: {e}")))?;

        if affected == 0 {
            return Ok(false);
        }

        self.insert_event(
            id,
            &EventKind::StateChange { from, to },
            &format!("{from} -> {to}"),
        )
        .await?;
        debug!(task_id = %id, from = %from, to = %to, "Task state updated");
        Ok(true)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 datetime string (our canonical write format).
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn opt_text(v: &Option<String>) -> libsql::Value {
    match v {
        Some(s) => libsql::Value::Text(s.clone()),
        None => libsql::Value::Null,
    }
}

/// Map a libsql row to a Task (events loaded separately).
///
/// Column order matches TASK_COLUMNS:
/// 0:id, 1:state, 2:input, 3:result, 4:error, 5:metadata, 6:created_at, 7:updated_at
fn row_to_task(row: &libsql::Row) -> Result<Task, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Backend(format!("task row id: {e}")))?;
    let state_str: String = row
        .get(1)
        .map_err(|e| StoreError::Backend(format!("task row state: {e}")))?;
    let input: String = row
        .get(2)
        .map_err(|e| StoreError::Backend(format!("task row input: {e}")))?;
    let result: Option<String> = row.get(3).ok();
    let error: Option<String> = row.get(4).ok();
    let metadata_str: String = row
        .get(5)
        .map_err(|e| StoreError::Backend(format!("task row metadata: {e}")))?;
    let created_str: String = row
        .get(6)
        .map_err(|e| StoreError::Backend(format!("task row created_at: {e}")))?;
    let updated_str: String = row
        .get(7)
        .map_err(|e| StoreError::Backend(format!("task row updated_at: {e}")))?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| StoreError::Backend(format!("task row id parse: {e}")))?;
    let state: TaskState = state_str
        .parse()
        .map_err(|e| StoreError::Backend(format!("task row state parse: {e}")))?;
    let metadata = serde_json::from_str(&metadata_str)
        .map_err(|e| StoreError::Serialization(format!("task metadata: {e}")))?;

    Ok(Task {
        id,
        state,
        input,
        result,
        error,
        metadata,
        events: Vec::new(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_event(row: &libsql::Row, task_id: Uuid) -> Result<TaskEvent, StoreError> {
    let seq: i64 = row
        .get(0)
        .map_err(|e| StoreError::Backend(format!("event row seq: {e}")))?;
    let kind_str: String = row
        .get(1)
        .map_err(|e| StoreError::Backend(format!("event row kind: {e}")))?;
    let payload: String = row
        .get(2)
        .map_err(|e| StoreError::Backend(format!("event row payload: {e}")))?;
    let created_str: String = row
        .get(3)
        .map_err(|e| StoreError::Backend(format!("event row created_at: {e}")))?;

    let kind: EventKind = serde_json::from_str(&kind_str)
        .map_err(|e| StoreError::Serialization(format!("event kind: {e}")))?;

    Ok(TaskEvent {
        task_id,
        seq: seq as u64,
        kind,
        payload,
        timestamp: parse_datetime(&created_str),
    })
}

#[async_trait]
impl TaskStore for LibSqlStore {
    async fn create(&self, task: Task) -> Result<Task, StoreError> {
        let metadata = serde_json::to_string(&task.metadata)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO tasks (id, state, input, result, error, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, NULL, NULL, ?4, ?5, ?6)",
                params![
                    task.id.to_string(),
                    task.state.to_string(),
                    task.input.clone(),
                    metadata,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("create task: {e}")))?;

        if inserted == 0 {
            return Err(StoreError::DuplicateId { id: task.id });
        }
        debug!(task_id = %task.id, "Task created");
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        match self.get_row(id).await? {
            Some(mut task) => {
                task.events = self.events_since(id, 0).await?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn update_state(
        &self,
        id: Uuid,
        new_state: TaskState,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<Task, StoreError> {
        // Read-validate-conditionally-update; retry if another caller
        // transitions the row in between.
        loop {
            let current = self
                .get_row(id)
                .await?
                .ok_or(StoreError::NotFound { id })?;

            if !current.state.can_transition_to(new_state) {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: current.state,
                    to: new_state,
                });
            }

            if self
                .try_transition(id, current.state, new_state, result.clone(), error.clone())
                .await?
            {
                return self.load_task(id).await;
            }
        }
    }

    async fn list_by_state(&self, state: TaskState) -> Result<Vec<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE state = ?1 ORDER BY created_at, id"
                ),
                params![state.to_string()],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("list_by_state: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn next_pending(&self) -> Result<Option<Task>, StoreError> {
        loop {
            let mut rows = self
                .conn()
                .query(
                    "SELECT id FROM tasks WHERE state = 'pending' ORDER BY created_at, id LIMIT 1",
                    (),
                )
                .await
                .map_err(|e| StoreError::Backend(format!("next_pending: {e}")))?;

            let id = match rows.next().await {
                Ok(Some(row)) => {
                    let id_str: String = row
                        .get(0)
                        .map_err(|e| StoreError::Backend(format!("next_pending id: {e}")))?;
                    Uuid::parse_str(&id_str)
                        .map_err(|e| StoreError::Backend(format!("next_pending id parse: {e}")))?
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(StoreError::Backend(format!("next_pending: {e}"))),
            };

            // Conditional claim; on a race the loser retries with the next row.
            if self
                .try_transition(id, TaskState::Pending, TaskState::Running, None, None)
                .await?
            {
                return Ok(Some(self.load_task(id).await?));
            }
        }
    }

    async fn add_event(
        &self,
        id: Uuid,
        kind: EventKind,
        payload: String,
    ) -> Result<TaskEvent, StoreError> {
        if self.get_row(id).await?.is_none() {
            return Err(StoreError::NotFound { id });
        }
        self.insert_event(id, &kind, &payload).await
    }

    async fn events_since(&self, id: Uuid, after_seq: u64) -> Result<Vec<TaskEvent>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT seq, kind, payload, created_at FROM task_events
                 WHERE task_id = ?1 AND seq > ?2 ORDER BY seq",
                params![id.to_string(), after_seq as i64],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("events_since: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            events.push(row_to_event(&row, id)?);
        }
        Ok(events)
    }

    async fn requeue_stale(
        &self,
        older_than: DateTime<Utc>,
        exclude: &[Uuid],
    ) -> Result<Vec<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM tasks WHERE state = 'running' AND updated_at < ?1",
                params![older_than.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("requeue_stale: {e}")))?;

        let mut stale = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row
                .get(0)
                .map_err(|e| StoreError::Backend(format!("requeue_stale id: {e}")))?;
            let id = Uuid::parse_str(&id_str)
                .map_err(|e| StoreError::Backend(format!("requeue_stale id parse: {e}")))?;
            if !exclude.contains(&id) {
                stale.push(id);
            }
        }

        let mut requeued = Vec::new();
        for id in stale {
            if self
                .try_transition(id, TaskState::Running, TaskState::Pending, None, None)
                .await?
            {
                requeued.push(self.load_task(id).await?);
            }
        }
        Ok(requeued)
    }

    async fn set_input(&self, id: Uuid, input: String) -> Result<Task, StoreError> {
        let current = self
            .get_row(id)
            .await?
            .ok_or(StoreError::NotFound { id })?;
        if current.state.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.state,
                to: current.state,
            });
        }

        self.conn()
            .execute(
                "UPDATE tasks SET input = ?1, updated_at = ?2 WHERE id = ?3",
                params![input, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("set_input: {e}")))?;

        self.load_task(id).await
    }
}

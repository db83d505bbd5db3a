//! libSQL backend — async `Store` implementation.
//!
//! A single reused connection backs all operations; `libsql::Connection`
//! is `Send + Sync` and safe for concurrent async use. Claim and status
//! transitions are single conditional UPDATEs: the rows-affected count is
//! the arbitration result, no locks above it.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{params, Connection, Database};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::model::{
    new_id, AgentStatus, Card, Column, Comment, NewTask, Task, TaskStatus, TaskType, Worker,
    WorkerStatus,
};
use crate::store::traits::{Store, TaskFields, TaskFilter};

/// Maximum retries for a write hitting transient engine contention.
const WRITE_RETRIES: u32 = 5;
/// First retry delay; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_millis(10);
/// Retry delay cap.
const RETRY_MAX: Duration = Duration::from_millis(160);

/// libSQL store backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Storage(format!("create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Storage(format!("open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Storage(format!("connect: {e}")))?;

        let store = Self { db, conn };
        store.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (tests, ephemeral runs).
    pub async fn open_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Storage(format!("open in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Storage(format!("connect: {e}")))?;

        let store = Self { db, conn };
        store.init_schema().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Current time in the canonical column format. Fixed microsecond width
/// keeps lexicographic comparison consistent with time order.
fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn fmt_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Whether an engine error is worth retrying (lock contention, busy).
fn is_transient(e: &libsql::Error) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("busy") || msg.contains("locked")
}

/// Run a write closure with capped exponential backoff on transient
/// engine errors.
async fn with_write_retry<T, F, Fut>(op: &'static str, mut attempt_fn: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, libsql::Error>>,
{
    let mut delay = RETRY_BASE;
    let mut attempts = 0;
    loop {
        match attempt_fn().await {
            Ok(v) => return Ok(v),
            Err(e) if attempts < WRITE_RETRIES && is_transient(&e) => {
                attempts += 1;
                debug!(op, attempts, "Retrying write after transient error");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX);
            }
            Err(e) => return Err(StoreError::Storage(format!("{op}: {e}"))),
        }
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

const WORKER_COLUMNS: &str = "id, user_id, hostname, worker_version, capabilities, status, \
     last_heartbeat, registered_at, max_concurrent_tasks";

fn row_to_worker(row: &libsql::Row) -> Result<Worker, libsql::Error> {
    let capabilities_json: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let heartbeat_str: Option<String> = row.get(6).ok();
    let registered_str: String = row.get(7)?;

    Ok(Worker {
        id: row.get(0)?,
        user_id: row.get(1)?,
        hostname: row.get(2)?,
        version: row.get(3)?,
        capabilities: serde_json::from_str(&capabilities_json).unwrap_or_default(),
        status: WorkerStatus::parse(&status_str),
        last_heartbeat: parse_optional_datetime(&heartbeat_str),
        registered_at: parse_datetime(&registered_str),
        max_concurrent_tasks: row.get::<i64>(8)?.max(1) as u32,
    })
}

const TASK_COLUMNS: &str = "id, task_type, board_id, card_id, created_by, assigned_to, \
     claimed_by_worker, agent_type, agent_model, prompt_text, payload, status, priority, \
     source_column_id, target_column_id, failure_column_id, loop_count, max_loop_count, \
     error_summary, output_comment_id, created_at, claimed_at, started_at, completed_at";

fn row_to_task(row: &libsql::Row) -> Result<Task, libsql::Error> {
    let type_str: String = row.get(1)?;
    let payload_json: String = row.get(10)?;
    let status_str: String = row.get(11)?;
    let created_str: String = row.get(20)?;
    let claimed_str: Option<String> = row.get(21).ok();
    let started_str: Option<String> = row.get(22).ok();
    let completed_str: Option<String> = row.get(23).ok();

    Ok(Task {
        id: row.get(0)?,
        task_type: TaskType::parse(&type_str).unwrap_or(TaskType::AgentRun),
        board_id: row.get(2)?,
        card_id: row.get(3).ok(),
        created_by: row.get(4)?,
        assigned_to: row.get(5).ok(),
        claimed_by_worker: row.get(6).ok(),
        agent_type: row.get(7)?,
        agent_model: row.get(8)?,
        prompt_text: row.get(9)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::json!({})),
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Pending),
        priority: row.get(12)?,
        source_column_id: row.get(13)?,
        target_column_id: row.get(14)?,
        failure_column_id: row.get(15)?,
        loop_count: row.get(16)?,
        max_loop_count: row.get(17)?,
        error_summary: row.get(18)?,
        output_comment_id: row.get(19)?,
        created_at: parse_datetime(&created_str),
        claimed_at: parse_optional_datetime(&claimed_str),
        started_at: parse_optional_datetime(&started_str),
        completed_at: parse_optional_datetime(&completed_str),
    })
}

const CARD_COLUMNS: &str = "id, column_id, board_id, title, description, labels, priority, \
     assignee_id, agent_status, position, version";

fn row_to_card(row: &libsql::Row) -> Result<Card, libsql::Error> {
    let labels_json: String = row.get(5)?;
    let agent_status_str: String = row.get(8)?;

    Ok(Card {
        id: row.get(0)?,
        column_id: row.get(1)?,
        board_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        priority: row.get(6)?,
        assignee_id: row.get(7).ok(),
        agent_status: AgentStatus::parse(&agent_status_str),
        position: row.get(9)?,
        version: row.get(10)?,
    })
}

const COLUMN_COLUMNS: &str = "id, board_id, name, position, auto_run, agent_type, agent_model, \
     prompt_template, on_success_column_id, on_failure_column_id, max_loop_count";

fn row_to_column(row: &libsql::Row) -> Result<Column, libsql::Error> {
    Ok(Column {
        id: row.get(0)?,
        board_id: row.get(1)?,
        name: row.get(2)?,
        position: row.get(3)?,
        auto_run: row.get::<i64>(4)? != 0,
        agent_type: row.get(5)?,
        agent_model: row.get(6)?,
        prompt_template: row.get(7)?,
        on_success_column_id: row.get(8)?,
        on_failure_column_id: row.get(9)?,
        max_loop_count: row.get(10)?,
    })
}

const COMMENT_COLUMNS: &str = "id, card_id, user_id, content, is_agent_output, created_at";

fn row_to_comment(row: &libsql::Row) -> Result<Comment, libsql::Error> {
    let created_str: String = row.get(5)?;
    Ok(Comment {
        id: row.get(0)?,
        card_id: row.get(1)?,
        user_id: row.get(2)?,
        content: row.get(3)?,
        is_agent_output: row.get::<i64>(4)? != 0,
        created_at: parse_datetime(&created_str),
    })
}

/// Build `'a','b','c'` from validated enum strings for an IN clause.
fn status_in_list(statuses: &[TaskStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn upsert_worker(
        &self,
        user_id: &str,
        hostname: &str,
        version: &str,
        capabilities: &[String],
        max_concurrent_tasks: u32,
    ) -> Result<Worker, StoreError> {
        let conn = self.conn();
        let worker_id = new_id();
        let caps_json =
            serde_json::to_string(capabilities).unwrap_or_else(|_| "[]".to_string());
        let now = now_str();

        with_write_retry("upsert_worker", || {
            conn.execute(
                "INSERT INTO workers (id, user_id, hostname, worker_version, capabilities, \
                     status, last_heartbeat, registered_at, max_concurrent_tasks)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'online', ?6, ?6, ?7)
                 ON CONFLICT(user_id) DO UPDATE SET
                     hostname = excluded.hostname,
                     worker_version = excluded.worker_version,
                     capabilities = excluded.capabilities,
                     status = 'online',
                     last_heartbeat = excluded.last_heartbeat",
                params![
                    worker_id.clone(),
                    user_id.to_string(),
                    hostname.to_string(),
                    version.to_string(),
                    caps_json.clone(),
                    now.clone(),
                    max_concurrent_tasks as i64,
                ],
            )
        })
        .await?;

        // The upsert may have kept an existing row; read back the real one.
        self.get_worker_for_user(user_id)
            .await?
            .ok_or_else(|| StoreError::Storage("upserted worker row vanished".to_string()))
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Option<Worker>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
                params![worker_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("get_worker: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_worker(&row).map_err(|e| {
                StoreError::Storage(format!("get_worker row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Storage(format!("get_worker: {e}"))),
        }
    }

    async fn get_worker_for_user(&self, user_id: &str) -> Result<Option<Worker>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE user_id = ?1"),
                params![user_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("get_worker_for_user: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_worker(&row).map_err(|e| {
                StoreError::Storage(format!("get_worker_for_user row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Storage(format!("get_worker_for_user: {e}"))),
        }
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY registered_at DESC"),
                (),
            )
            .await
            .map_err(|e| StoreError::Storage(format!("list_workers: {e}")))?;

        let mut workers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_worker(&row) {
                Ok(w) => workers.push(w),
                Err(e) => tracing::warn!("Skipping worker row: {e}"),
            }
        }
        Ok(workers)
    }

    async fn touch_heartbeat(&self, worker_id: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = now_str();

        // The timestamp guard keeps last_heartbeat monotonic even if two
        // heartbeats race or a clock hiccups.
        let affected = with_write_retry("touch_heartbeat", || {
            conn.execute(
                "UPDATE workers SET status = 'online', last_heartbeat = ?1
                 WHERE id = ?2 AND (last_heartbeat IS NULL OR last_heartbeat <= ?1)",
                params![now.clone(), worker_id.to_string()],
            )
        })
        .await?;

        if affected == 0 && self.get_worker(worker_id).await?.is_none() {
            return Err(StoreError::not_found("worker", worker_id));
        }
        Ok(())
    }

    async fn set_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        let affected = with_write_retry("set_worker_status", || {
            conn.execute(
                "UPDATE workers SET status = ?1 WHERE id = ?2",
                params![status.as_str(), worker_id.to_string()],
            )
        })
        .await?;

        if affected == 0 {
            return Err(StoreError::not_found("worker", worker_id));
        }
        Ok(())
    }

    async fn workers_with_heartbeat_older_than(
        &self,
        statuses: &[WorkerStatus],
        age_ms: i64,
    ) -> Result<Vec<Worker>, StoreError> {
        let cutoff = fmt_time(Utc::now() - chrono::Duration::milliseconds(age_ms));
        let status_list = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {WORKER_COLUMNS} FROM workers
                     WHERE status IN ({status_list})
                       AND (last_heartbeat IS NULL OR last_heartbeat < ?1)"
                ),
                params![cutoff],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("workers_with_heartbeat_older_than: {e}")))?;

        let mut workers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_worker(&row) {
                Ok(w) => workers.push(w),
                Err(e) => tracing::warn!("Skipping worker row: {e}"),
            }
        }
        Ok(workers)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, new: &NewTask) -> Result<Task, StoreError> {
        let conn = self.conn();
        let task_id = new_id();
        let now = Utc::now();
        let payload_json =
            serde_json::to_string(&new.payload).unwrap_or_else(|_| "{}".to_string());

        with_write_retry("insert_task", || {
            conn.execute(
                "INSERT INTO tasks (id, task_type, board_id, card_id, created_by, assigned_to, \
                     agent_type, agent_model, prompt_text, payload, priority, source_column_id, \
                     target_column_id, failure_column_id, loop_count, max_loop_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    task_id.clone(),
                    new.task_type.as_str(),
                    new.board_id.clone(),
                    opt_text_owned(new.card_id.clone()),
                    new.created_by.clone(),
                    opt_text_owned(new.assigned_to.clone()),
                    new.agent_type.clone(),
                    new.agent_model.clone(),
                    new.prompt_text.clone(),
                    payload_json.clone(),
                    new.priority,
                    new.source_column_id.clone(),
                    new.target_column_id.clone(),
                    new.failure_column_id.clone(),
                    new.loop_count,
                    new.max_loop_count,
                    fmt_time(now),
                ],
            )
        })
        .await?;

        debug!(task_id = %task_id, task_type = new.task_type.as_str(), "Task inserted");

        Ok(Task {
            id: task_id,
            task_type: new.task_type,
            board_id: new.board_id.clone(),
            card_id: new.card_id.clone(),
            created_by: new.created_by.clone(),
            assigned_to: new.assigned_to.clone(),
            claimed_by_worker: None,
            agent_type: new.agent_type.clone(),
            agent_model: new.agent_model.clone(),
            prompt_text: new.prompt_text.clone(),
            payload: new.payload.clone(),
            status: TaskStatus::Pending,
            priority: new.priority,
            source_column_id: new.source_column_id.clone(),
            target_column_id: new.target_column_id.clone(),
            failure_column_id: new.failure_column_id.clone(),
            loop_count: new.loop_count,
            max_loop_count: new.max_loop_count,
            error_summary: String::new(),
            output_comment_id: String::new(),
            created_at: now,
            claimed_at: None,
            started_at: None,
            completed_at: None,
        })
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_task(&row)
                .map_err(|e| StoreError::Storage(format!("get_task row parse: {e}"))),
            Ok(None) => Err(StoreError::not_found("task", task_id)),
            Err(e) => Err(StoreError::Storage(format!("get_task: {e}"))),
        }
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut conditions = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if let Some(board_id) = &filter.board_id {
            values.push(libsql::Value::Text(board_id.clone()));
            conditions.push(format!("board_id = ?{}", values.len()));
        }
        if let Some(card_id) = &filter.card_id {
            values.push(libsql::Value::Text(card_id.clone()));
            conditions.push(format!("card_id = ?{}", values.len()));
        }
        if let Some(status) = &filter.status {
            values.push(libsql::Value::Text(status.as_str().to_string()));
            conditions.push(format!("status = ?{}", values.len()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks{where_clause} ORDER BY created_at DESC"
                ),
                values,
            )
            .await
            .map_err(|e| StoreError::Storage(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(t) => tasks.push(t),
                Err(e) => tracing::warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn poll_pending_tasks(&self, user_id: &str, limit: u32) -> Result<Vec<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status = 'pending'
                       AND (assigned_to = ?1
                            OR (assigned_to IS NULL AND board_id IN (
                                SELECT board_id FROM board_members WHERE user_id = ?1)))
                     ORDER BY priority DESC, created_at ASC
                     LIMIT ?2"
                ),
                params![user_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("poll_pending_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(t) => tasks.push(t),
                Err(e) => tracing::warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn claim_task(&self, task_id: &str, worker_id: &str) -> Result<Task, StoreError> {
        let conn = self.conn();
        let now = now_str();

        let affected = with_write_retry("claim_task", || {
            conn.execute(
                "UPDATE tasks SET status = 'claimed', claimed_by_worker = ?1, claimed_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![worker_id.to_string(), now.clone(), task_id.to_string()],
            )
        })
        .await?;

        if affected == 0 {
            // Distinguish a lost race from a missing row.
            let task = self.get_task(task_id).await?;
            return Err(StoreError::Conflict(format!(
                "task {task_id} is {}, not pending",
                task.status.as_str()
            )));
        }

        debug!(task_id, worker_id, "Task claimed");
        self.get_task(task_id).await
    }

    async fn transition_task(
        &self,
        task_id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        fields: TaskFields,
    ) -> Result<Task, StoreError> {
        let conn = self.conn();
        let now = now_str();
        let in_list = status_in_list(from);
        let sql = format!(
            "UPDATE tasks SET status = ?1,
                 error_summary = COALESCE(?2, error_summary),
                 started_at = CASE WHEN ?3 THEN COALESCE(started_at, ?4)
                                   ELSE started_at END,
                 completed_at = CASE WHEN ?5 THEN ?4 ELSE completed_at END
             WHERE id = ?6 AND status IN ({in_list})"
        );

        let affected = with_write_retry("transition_task", || {
            conn.execute(
                &sql,
                params![
                    to.as_str(),
                    opt_text_owned(fields.error_summary.clone()),
                    fields.set_started_at as i64,
                    now.clone(),
                    fields.set_completed_at as i64,
                    task_id.to_string(),
                ],
            )
        })
        .await?;

        if affected == 0 {
            let task = self.get_task(task_id).await?;
            return Err(StoreError::Conflict(format!(
                "task {task_id} is {}, cannot transition to {}",
                task.status.as_str(),
                to.as_str()
            )));
        }

        debug!(task_id, to = to.as_str(), "Task transitioned");
        self.get_task(task_id).await
    }

    async fn tasks_held_by_worker(&self, worker_id: &str) -> Result<Vec<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE claimed_by_worker = ?1 AND status IN ('claimed', 'running')"
                ),
                params![worker_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("tasks_held_by_worker: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(t) => tasks.push(t),
                Err(e) => tracing::warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn count_tasks_for(
        &self,
        card_id: &str,
        source_column_id: &str,
    ) -> Result<i64, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM tasks WHERE card_id = ?1 AND source_column_id = ?2",
                params![card_id.to_string(), source_column_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("count_tasks_for: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| StoreError::Storage(format!("count_tasks_for parse: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(StoreError::Storage(format!("count_tasks_for: {e}"))),
        }
    }

    async fn cancelled_among(&self, ids: &[String]) -> Result<Vec<String>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (1..=ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let values: Vec<libsql::Value> = ids
            .iter()
            .map(|id| libsql::Value::Text(id.clone()))
            .collect();

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT id FROM tasks WHERE id IN ({placeholders}) AND status = 'cancelled'"
                ),
                values,
            )
            .await
            .map_err(|e| StoreError::Storage(format!("cancelled_among: {e}")))?;

        let mut cancelled = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(id) = row.get::<String>(0) {
                cancelled.push(id);
            }
        }
        Ok(cancelled)
    }

    async fn set_output_comment(
        &self,
        task_id: &str,
        comment_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        with_write_retry("set_output_comment", || {
            conn.execute(
                "UPDATE tasks SET output_comment_id = ?1 WHERE id = ?2",
                params![comment_id.to_string(), task_id.to_string()],
            )
        })
        .await?;
        Ok(())
    }

    // ── Cards / columns / comments ──────────────────────────────────

    async fn get_card(&self, card_id: &str) -> Result<Card, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CARD_COLUMNS} FROM cards WHERE id = ?1"),
                params![card_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("get_card: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_card(&row)
                .map_err(|e| StoreError::Storage(format!("get_card row parse: {e}"))),
            Ok(None) => Err(StoreError::not_found("card", card_id)),
            Err(e) => Err(StoreError::Storage(format!("get_card: {e}"))),
        }
    }

    async fn insert_card(&self, card: &Card) -> Result<(), StoreError> {
        let conn = self.conn();
        let labels_json =
            serde_json::to_string(&card.labels).unwrap_or_else(|_| "[]".to_string());
        let now = now_str();

        with_write_retry("insert_card", || {
            conn.execute(
                "INSERT INTO cards (id, column_id, board_id, title, description, labels, \
                     priority, assignee_id, agent_status, position, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                         (SELECT COALESCE(MAX(position) + 1, 0) FROM cards WHERE column_id = ?2),
                         0, ?10, ?10)",
                params![
                    card.id.clone(),
                    card.column_id.clone(),
                    card.board_id.clone(),
                    card.title.clone(),
                    card.description.clone(),
                    labels_json.clone(),
                    card.priority.clone(),
                    opt_text_owned(card.assignee_id.clone()),
                    card.agent_status.as_str(),
                    now.clone(),
                ],
            )
        })
        .await?;
        Ok(())
    }

    async fn move_card(
        &self,
        card_id: &str,
        to_column_id: &str,
        expected_version: i64,
    ) -> Result<Card, StoreError> {
        let conn = self.conn();
        let now = now_str();

        let affected = with_write_retry("move_card", || {
            conn.execute(
                "UPDATE cards SET column_id = ?1,
                     position = (SELECT COALESCE(MAX(position) + 1, 0) FROM cards
                                 WHERE column_id = ?1 AND id != ?2),
                     version = version + 1,
                     updated_at = ?3
                 WHERE id = ?2 AND version = ?4",
                params![
                    to_column_id.to_string(),
                    card_id.to_string(),
                    now.clone(),
                    expected_version,
                ],
            )
        })
        .await?;

        if affected == 0 {
            let card = self.get_card(card_id).await?;
            return Err(StoreError::Conflict(format!(
                "card {card_id} moved concurrently (version {} != {expected_version})",
                card.version
            )));
        }

        self.get_card(card_id).await
    }

    async fn set_card_agent_status(
        &self,
        card_id: &str,
        status: AgentStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = now_str();
        with_write_retry("set_card_agent_status", || {
            conn.execute(
                "UPDATE cards SET agent_status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now.clone(), card_id.to_string()],
            )
        })
        .await?;
        Ok(())
    }

    async fn get_column(&self, column_id: &str) -> Result<Column, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {COLUMN_COLUMNS} FROM columns WHERE id = ?1"),
                params![column_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("get_column: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_column(&row)
                .map_err(|e| StoreError::Storage(format!("get_column row parse: {e}"))),
            Ok(None) => Err(StoreError::not_found("column", column_id)),
            Err(e) => Err(StoreError::Storage(format!("get_column: {e}"))),
        }
    }

    async fn list_columns(&self, board_id: &str) -> Result<Vec<Column>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {COLUMN_COLUMNS} FROM columns WHERE board_id = ?1 ORDER BY position ASC"
                ),
                params![board_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("list_columns: {e}")))?;

        let mut columns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_column(&row) {
                Ok(c) => columns.push(c),
                Err(e) => tracing::warn!("Skipping column row: {e}"),
            }
        }
        Ok(columns)
    }

    async fn insert_column(&self, column: &Column) -> Result<(), StoreError> {
        let conn = self.conn();
        with_write_retry("insert_column", || {
            conn.execute(
                "INSERT INTO columns (id, board_id, name, position, auto_run, agent_type, \
                     agent_model, prompt_template, on_success_column_id, on_failure_column_id, \
                     max_loop_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    column.id.clone(),
                    column.board_id.clone(),
                    column.name.clone(),
                    column.position,
                    column.auto_run as i64,
                    column.agent_type.clone(),
                    column.agent_model.clone(),
                    column.prompt_template.clone(),
                    column.on_success_column_id.clone(),
                    column.on_failure_column_id.clone(),
                    column.max_loop_count,
                ],
            )
        })
        .await?;
        Ok(())
    }

    async fn update_column_routing(
        &self,
        column_id: &str,
        on_success_column_id: Option<&str>,
        on_failure_column_id: Option<&str>,
    ) -> Result<Column, StoreError> {
        let conn = self.conn();
        let affected = with_write_retry("update_column_routing", || {
            conn.execute(
                "UPDATE columns SET
                     on_success_column_id = COALESCE(?1, on_success_column_id),
                     on_failure_column_id = COALESCE(?2, on_failure_column_id)
                 WHERE id = ?3",
                params![
                    opt_text_owned(on_success_column_id.map(str::to_string)),
                    opt_text_owned(on_failure_column_id.map(str::to_string)),
                    column_id.to_string(),
                ],
            )
        })
        .await?;

        if affected == 0 {
            return Err(StoreError::not_found("column", column_id));
        }
        self.get_column(column_id).await
    }

    async fn insert_comment(
        &self,
        card_id: &str,
        user_id: &str,
        content: &str,
        is_agent_output: bool,
    ) -> Result<Comment, StoreError> {
        let conn = self.conn();
        let comment_id = new_id();
        let now = Utc::now();

        with_write_retry("insert_comment", || {
            conn.execute(
                "INSERT INTO card_comments (id, card_id, user_id, content, is_agent_output, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    comment_id.clone(),
                    card_id.to_string(),
                    user_id.to_string(),
                    content.to_string(),
                    is_agent_output as i64,
                    fmt_time(now),
                ],
            )
        })
        .await?;

        Ok(Comment {
            id: comment_id,
            card_id: card_id.to_string(),
            user_id: user_id.to_string(),
            content: content.to_string(),
            is_agent_output,
            created_at: now,
        })
    }

    async fn list_comments(&self, card_id: &str) -> Result<Vec<Comment>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {COMMENT_COLUMNS} FROM card_comments
                     WHERE card_id = ?1 ORDER BY created_at ASC"
                ),
                params![card_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("list_comments: {e}")))?;

        let mut comments = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_comment(&row) {
                Ok(c) => comments.push(c),
                Err(e) => tracing::warn!("Skipping comment row: {e}"),
            }
        }
        Ok(comments)
    }

    async fn last_agent_comment(&self, card_id: &str) -> Result<Option<Comment>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {COMMENT_COLUMNS} FROM card_comments
                     WHERE card_id = ?1 AND is_agent_output = 1
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![card_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("last_agent_comment: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_comment(&row).map_err(|e| {
                StoreError::Storage(format!("last_agent_comment row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Storage(format!("last_agent_comment: {e}"))),
        }
    }

    // ── Boards ──────────────────────────────────────────────────────

    async fn get_board_name(&self, board_id: &str) -> Result<String, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT name FROM boards WHERE id = ?1",
                params![board_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("get_board_name: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| StoreError::Storage(format!("get_board_name parse: {e}"))),
            Ok(None) => Err(StoreError::not_found("board", board_id)),
            Err(e) => Err(StoreError::Storage(format!("get_board_name: {e}"))),
        }
    }

    async fn board_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT board_id FROM board_members WHERE user_id = ?1",
                params![user_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("board_ids_for_user: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(id) = row.get::<String>(0) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn user_is_board_member(
        &self,
        board_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM board_members WHERE board_id = ?1 AND user_id = ?2",
                params![board_id.to_string(), user_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Storage(format!("user_is_board_member: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(StoreError::Storage(format!("user_is_board_member: {e}"))),
        }
    }

    async fn insert_board(
        &self,
        board_id: &str,
        name: &str,
        members: &[String],
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        with_write_retry("insert_board", || {
            conn.execute(
                "INSERT INTO boards (id, name) VALUES (?1, ?2)",
                params![board_id.to_string(), name.to_string()],
            )
        })
        .await?;

        for member in members {
            with_write_retry("insert_board_member", || {
                conn.execute(
                    "INSERT OR IGNORE INTO board_members (board_id, user_id) VALUES (?1, ?2)",
                    params![board_id.to_string(), member.clone()],
                )
            })
            .await?;
        }
        Ok(())
    }
}

//! Backend-agnostic `Store` trait — the single persistence seam.
//!
//! The claim and transition operations are the concurrency primitives the
//! whole queue is built on: both are single conditional updates, and no
//! layer above the store caches task status.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::model::{
    AgentStatus, Card, Column, Comment, NewTask, Task, TaskStatus, Worker, WorkerStatus,
};

/// Filter for task listing.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub board_id: Option<String>,
    pub card_id: Option<String>,
    pub status: Option<TaskStatus>,
}

/// Optional field writes applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TaskFields {
    pub error_summary: Option<String>,
    /// Set `started_at` to now (only if currently unset).
    pub set_started_at: bool,
    /// Set `completed_at` to now.
    pub set_completed_at: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Create all tables idempotently.
    async fn init_schema(&self) -> Result<(), StoreError>;

    // ── Workers ─────────────────────────────────────────────────────

    /// Register or re-register a worker for a user. Upserts on the
    /// per-user uniqueness constraint; re-registration keeps the existing
    /// worker id and updates the row in place with status online.
    async fn upsert_worker(
        &self,
        user_id: &str,
        hostname: &str,
        version: &str,
        capabilities: &[String],
        max_concurrent_tasks: u32,
    ) -> Result<Worker, StoreError>;

    async fn get_worker(&self, worker_id: &str) -> Result<Option<Worker>, StoreError>;

    async fn get_worker_for_user(&self, user_id: &str) -> Result<Option<Worker>, StoreError>;

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError>;

    /// Record a heartbeat: status back to online, `last_heartbeat` moves
    /// forward only (never backwards).
    async fn touch_heartbeat(&self, worker_id: &str) -> Result<(), StoreError>;

    async fn set_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), StoreError>;

    /// Workers in any of `statuses` whose heartbeat is older than
    /// `age_ms` milliseconds (or who never heartbeated).
    async fn workers_with_heartbeat_older_than(
        &self,
        statuses: &[WorkerStatus],
        age_ms: i64,
    ) -> Result<Vec<Worker>, StoreError>;

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, new: &NewTask) -> Result<Task, StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Task, StoreError>;

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Pending tasks visible to a user's worker: directly assigned to the
    /// user, or unassigned on a board the user is a member of. Highest
    /// priority first, then oldest first.
    async fn poll_pending_tasks(&self, user_id: &str, limit: u32) -> Result<Vec<Task>, StoreError>;

    /// Atomic claim: a single conditional update keyed on
    /// `(id, status = pending)`. Zero rows affected means another worker
    /// won the race → `Conflict`.
    async fn claim_task(&self, task_id: &str, worker_id: &str) -> Result<Task, StoreError>;

    /// Guarded status transition: updates the row only while its status is
    /// one of `from`. Zero rows affected on an existing task → `Conflict`.
    async fn transition_task(
        &self,
        task_id: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        fields: TaskFields,
    ) -> Result<Task, StoreError>;

    /// Tasks a worker currently holds in claimed or running state.
    async fn tasks_held_by_worker(&self, worker_id: &str) -> Result<Vec<Task>, StoreError>;

    /// Number of tasks ever created for a (card, source column) pair —
    /// the automation loop count.
    async fn count_tasks_for(
        &self,
        card_id: &str,
        source_column_id: &str,
    ) -> Result<i64, StoreError>;

    /// Subset of `ids` whose task is cancelled server-side.
    async fn cancelled_among(&self, ids: &[String]) -> Result<Vec<String>, StoreError>;

    async fn set_output_comment(
        &self,
        task_id: &str,
        comment_id: &str,
    ) -> Result<(), StoreError>;

    // ── Cards / columns / comments (consumed surface) ───────────────

    async fn get_card(&self, card_id: &str) -> Result<Card, StoreError>;

    async fn insert_card(&self, card: &Card) -> Result<(), StoreError>;

    /// Move a card to the end of a column, conditional on the version the
    /// caller observed. A version mismatch (concurrent move) → `Conflict`.
    async fn move_card(
        &self,
        card_id: &str,
        to_column_id: &str,
        expected_version: i64,
    ) -> Result<Card, StoreError>;

    async fn set_card_agent_status(
        &self,
        card_id: &str,
        status: AgentStatus,
    ) -> Result<(), StoreError>;

    async fn get_column(&self, column_id: &str) -> Result<Column, StoreError>;

    async fn list_columns(&self, board_id: &str) -> Result<Vec<Column>, StoreError>;

    async fn insert_column(&self, column: &Column) -> Result<(), StoreError>;

    /// Update a column's routing targets. `None` leaves a side unchanged.
    async fn update_column_routing(
        &self,
        column_id: &str,
        on_success_column_id: Option<&str>,
        on_failure_column_id: Option<&str>,
    ) -> Result<Column, StoreError>;

    async fn insert_comment(
        &self,
        card_id: &str,
        user_id: &str,
        content: &str,
        is_agent_output: bool,
    ) -> Result<Comment, StoreError>;

    async fn list_comments(&self, card_id: &str) -> Result<Vec<Comment>, StoreError>;

    /// Most recent agent-output comment on a card, if any.
    async fn last_agent_comment(&self, card_id: &str) -> Result<Option<Comment>, StoreError>;

    // ── Boards (consumed) ───────────────────────────────────────────

    async fn get_board_name(&self, board_id: &str) -> Result<String, StoreError>;

    async fn board_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    async fn user_is_board_member(
        &self,
        board_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError>;

    /// Create a board with its member list. The dispatch core only reads
    /// boards; this exists for seeding and the planner path.
    async fn insert_board(
        &self,
        board_id: &str,
        name: &str,
        members: &[String],
    ) -> Result<(), StoreError>;
}

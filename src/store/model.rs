//! Row models — workers, tasks, and the consumed board surface
//! (cards, columns, comments).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a new row id (32 lowercase hex chars).
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// ── Workers ─────────────────────────────────────────────────────────

/// Liveness state of a worker, driven by heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Stale,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Stale => "stale",
            Self::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "online" => Self::Online,
            "stale" => Self::Stale,
            _ => Self::Offline,
        }
    }
}

/// A registered worker process. At most one row per user; re-registration
/// updates in place. Rows are retained after the worker goes offline so
/// task assignment history stays auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub user_id: String,
    pub hostname: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub max_concurrent_tasks: u32,
}

// ── Tasks ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    AgentRun,
    JiraImport,
    JiraPush,
    JiraSync,
    GitlabLink,
    GitlabCreateProject,
    GitlabPush,
    BoardPlan,
    CardGen,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentRun => "agent_run",
            Self::JiraImport => "jira_import",
            Self::JiraPush => "jira_push",
            Self::JiraSync => "jira_sync",
            Self::GitlabLink => "gitlab_link",
            Self::GitlabCreateProject => "gitlab_create_project",
            Self::GitlabPush => "gitlab_push",
            Self::BoardPlan => "board_plan",
            Self::CardGen => "card_gen",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "agent_run" => Self::AgentRun,
            "jira_import" => Self::JiraImport,
            "jira_push" => Self::JiraPush,
            "jira_sync" => Self::JiraSync,
            "gitlab_link" => Self::GitlabLink,
            "gitlab_create_project" => Self::GitlabCreateProject,
            "gitlab_push" => Self::GitlabPush,
            "board_plan" => Self::BoardPlan,
            "card_gen" => Self::CardGen,
            _ => return None,
        })
    }

    pub fn is_jira(&self) -> bool {
        matches!(self, Self::JiraImport | Self::JiraPush | Self::JiraSync)
    }

    pub fn is_gitlab(&self) -> bool {
        matches!(
            self,
            Self::GitlabLink | Self::GitlabCreateProject | Self::GitlabPush
        )
    }

    pub fn is_planner(&self) -> bool {
        matches!(self, Self::BoardPlan | Self::CardGen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "claimed" => Self::Claimed,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The status transition DAG:
    /// pending → claimed → running → {completed | failed}, with
    /// cancellation reachable from any non-terminal state.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Pending, Claimed) => true,
            (Claimed, Running) => true,
            (Claimed | Running, Completed | Failed) => true,
            (Pending | Claimed | Running, Cancelled) => true,
            _ => false,
        }
    }
}

/// A dispatchable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub board_id: String,
    pub card_id: Option<String>,
    pub created_by: String,
    pub assigned_to: Option<String>,
    pub claimed_by_worker: Option<String>,
    pub agent_type: String,
    pub agent_model: String,
    pub prompt_text: String,
    /// Opaque structured payload for integration tasks.
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub priority: i64,
    pub source_column_id: String,
    pub target_column_id: String,
    pub failure_column_id: String,
    pub loop_count: i64,
    pub max_loop_count: i64,
    pub error_summary: String,
    pub output_comment_id: String,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields for creating a new task. Everything not listed starts at its
/// zero value (`pending`, no claim, empty results).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: TaskType,
    pub board_id: String,
    pub card_id: Option<String>,
    pub created_by: String,
    pub assigned_to: Option<String>,
    pub agent_type: String,
    pub agent_model: String,
    pub prompt_text: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub source_column_id: String,
    pub target_column_id: String,
    pub failure_column_id: String,
    pub loop_count: i64,
    pub max_loop_count: i64,
}

impl NewTask {
    /// A minimal task of the given type on a board.
    pub fn new(task_type: TaskType, board_id: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            task_type,
            board_id: board_id.into(),
            card_id: None,
            created_by: created_by.into(),
            assigned_to: None,
            agent_type: String::new(),
            agent_model: "smart".to_string(),
            prompt_text: String::new(),
            payload: serde_json::json!({}),
            priority: 0,
            source_column_id: String::new(),
            target_column_id: String::new(),
            failure_column_id: String::new(),
            loop_count: 0,
            max_loop_count: 3,
        }
    }
}

// ── Consumed board surface ──────────────────────────────────────────

/// Agent activity marker shown on a card. The empty state means no
/// automation is pending, i.e. the card is unlocked for manual work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    #[serde(rename = "")]
    None,
    Pending,
    Running,
    Completed,
    Failed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::None,
        }
    }
}

/// A kanban card, as consumed and mutated by automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub column_id: String,
    pub board_id: String,
    pub title: String,
    pub description: String,
    pub labels: Vec<String>,
    pub priority: String,
    pub assignee_id: Option<String>,
    pub agent_status: AgentStatus,
    pub position: i64,
    /// Bumped on every move; moves are conditional on the observed value
    /// so two concurrent moves cannot both win.
    pub version: i64,
}

/// A board column. Automation fields make a column declarative: a card
/// entering an `auto_run` column creates a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub id: String,
    pub board_id: String,
    pub name: String,
    pub position: i64,
    pub auto_run: bool,
    pub agent_type: String,
    pub agent_model: String,
    pub prompt_template: String,
    pub on_success_column_id: String,
    pub on_failure_column_id: String,
    pub max_loop_count: i64,
}

/// A card comment. Agent output is attached as comments with
/// `is_agent_output` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub card_id: String,
    pub user_id: String,
    pub content: String,
    pub is_agent_output: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_dag_forward_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Claimed));
        assert!(Claimed.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Claimed.can_transition_to(Completed));
        assert!(Claimed.can_transition_to(Failed));
    }

    #[test]
    fn status_dag_cancellation_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Claimed.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Failed.can_transition_to(Cancelled));
    }

    #[test]
    fn status_dag_has_no_reverse_edges() {
        use TaskStatus::*;
        assert!(!Claimed.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Claimed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Running));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn task_type_roundtrip() {
        for t in [
            TaskType::AgentRun,
            TaskType::JiraImport,
            TaskType::GitlabPush,
            TaskType::BoardPlan,
            TaskType::CardGen,
        ] {
            assert_eq!(TaskType::parse(t.as_str()), Some(t));
        }
        assert_eq!(TaskType::parse("bogus"), None);
    }

    #[test]
    fn task_type_families() {
        assert!(TaskType::JiraSync.is_jira());
        assert!(TaskType::GitlabCreateProject.is_gitlab());
        assert!(TaskType::CardGen.is_planner());
        assert!(!TaskType::AgentRun.is_jira());
    }

    #[test]
    fn agent_status_empty_string_maps_to_none() {
        assert_eq!(AgentStatus::parse(""), AgentStatus::None);
        assert_eq!(AgentStatus::None.as_str(), "");
        assert_eq!(AgentStatus::parse("running"), AgentStatus::Running);
    }

    #[test]
    fn new_ids_are_unique_hex() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

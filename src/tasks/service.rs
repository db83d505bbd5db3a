//! Task lifecycle service.
//!
//! All worker-reported operations verify the reporting worker actually
//! holds the claim. Terminal reports on a cancelled task are accepted as
//! no-ops so a worker that lost the cancellation race doesn't error out.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use tracing::info;

use crate::automation::{AutomationEngine, Outcome};
use crate::error::StoreError;
use crate::events::{Event, EventBus};
use crate::store::model::{AgentStatus, NewTask, Task, TaskStatus};
use crate::store::{Store, TaskFields, TaskFilter};

/// Error summary recorded when a completion is reinterpreted as a
/// reviewer rejection.
pub const REJECTED_SUMMARY: &str = "rejected by reviewer";

/// A completion whose first output line matches this is routed through
/// the failure path. Word boundaries let a leading status token through
/// (`Review result: REJECTED`).
static REJECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(REJECTED|FAILED)\b").unwrap());

/// Whether agent output signals a rejection despite a `complete` report.
pub fn is_rejection(output_text: &str) -> bool {
    let first_line = output_text.lines().next().unwrap_or("");
    REJECTION.is_match(first_line)
}

/// Insert a pending task, mark its card, publish `task_created`. Shared
/// by the service and the automation engine.
pub async fn create_and_publish(
    store: &dyn Store,
    bus: &EventBus,
    new: &NewTask,
) -> Result<Task, StoreError> {
    let task = store.insert_task(new).await?;
    if let Some(card_id) = &task.card_id {
        store
            .set_card_agent_status(card_id, AgentStatus::Pending)
            .await?;
    }
    bus.publish_to_board(&task.board_id, Event::TaskCreated { task: task.clone() });
    Ok(task)
}

pub struct TaskService {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    automation: Arc<AutomationEngine>,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        automation: Arc<AutomationEngine>,
    ) -> Self {
        Self {
            store,
            bus,
            automation,
        }
    }

    pub async fn create(&self, new: &NewTask) -> Result<Task, StoreError> {
        create_and_publish(&*self.store, &self.bus, new).await
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, StoreError> {
        self.store.get_task(task_id).await
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.store.list_tasks(filter).await
    }

    /// Cancel a pending, claimed, or running task. The owning worker
    /// learns through its next heartbeat and kills local execution.
    pub async fn cancel(&self, task_id: &str) -> Result<Task, StoreError> {
        let task = self
            .store
            .transition_task(
                task_id,
                &[TaskStatus::Pending, TaskStatus::Claimed, TaskStatus::Running],
                TaskStatus::Cancelled,
                TaskFields {
                    set_completed_at: true,
                    ..Default::default()
                },
            )
            .await?;

        if let Some(card_id) = &task.card_id {
            self.store
                .set_card_agent_status(card_id, AgentStatus::None)
                .await?;
        }

        info!(task_id, "Task cancelled");
        self.bus
            .publish_to_board(&task.board_id, Event::TaskCancelled { task: task.clone() });
        Ok(task)
    }

    /// Atomic claim. Exactly one concurrent caller wins; the rest get
    /// `Conflict`.
    pub async fn claim(&self, task_id: &str, worker_id: &str) -> Result<Task, StoreError> {
        let task = self.store.claim_task(task_id, worker_id).await?;
        self.bus
            .publish_to_board(&task.board_id, Event::TaskClaimed { task: task.clone() });
        Ok(task)
    }

    /// Progress report. Idempotent: the first report moves claimed →
    /// running and stamps `started_at`; later reports only re-publish.
    #[allow(clippy::too_many_arguments)]
    pub async fn progress(
        &self,
        task_id: &str,
        worker_id: &str,
        progress_text: &str,
        step: Option<u32>,
        total_steps: Option<u32>,
        phase: Option<String>,
    ) -> Result<Task, StoreError> {
        let task = self.owned_task(task_id, worker_id).await?;

        let task = match task.status {
            TaskStatus::Claimed | TaskStatus::Running => {
                let task = self
                    .store
                    .transition_task(
                        task_id,
                        &[TaskStatus::Claimed, TaskStatus::Running],
                        TaskStatus::Running,
                        TaskFields {
                            set_started_at: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                if let Some(card_id) = &task.card_id {
                    self.store
                        .set_card_agent_status(card_id, AgentStatus::Running)
                        .await?;
                }
                task
            }
            // Late report on a finished task: nothing to update.
            _ => task,
        };

        self.bus.publish_to_board(
            &task.board_id,
            Event::TaskProgress {
                task_id: task_id.to_string(),
                progress_text: progress_text.to_string(),
                step,
                total_steps,
                phase,
            },
        );
        Ok(task)
    }

    /// Successful completion. Output whose first line signals a rejection
    /// is rerouted through the failure path even though the worker called
    /// `complete`.
    pub async fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        output_text: &str,
    ) -> Result<Task, StoreError> {
        let task = self.owned_task(task_id, worker_id).await?;

        if task.status == TaskStatus::Cancelled {
            return self.late_report(task, output_text).await;
        }

        if is_rejection(output_text) {
            info!(task_id, "Completion reinterpreted as rejection");
            return self
                .finish_failed(task, REJECTED_SUMMARY, output_text, Outcome::Rejection)
                .await;
        }

        let task = match self
            .store
            .transition_task(
                task_id,
                &[TaskStatus::Running, TaskStatus::Claimed],
                TaskStatus::Completed,
                TaskFields {
                    set_completed_at: true,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(task) => task,
            // Cancelled between the ownership check and the transition.
            Err(StoreError::Conflict(_)) => {
                let task = self.store.get_task(task_id).await?;
                if task.status == TaskStatus::Cancelled {
                    return self.late_report(task, output_text).await;
                }
                return Err(StoreError::Conflict(format!(
                    "task {task_id} is {}, cannot complete",
                    task.status.as_str()
                )));
            }
            Err(e) => return Err(e),
        };

        let task = self.attach_output(task, output_text).await?;
        if let Some(card_id) = &task.card_id {
            self.store
                .set_card_agent_status(card_id, AgentStatus::Completed)
                .await?;
        }

        info!(task_id, "Task completed");
        self.bus
            .publish_to_board(&task.board_id, Event::TaskCompleted { task: task.clone() });
        self.automation.on_terminal(&task, Outcome::Success).await;
        Ok(task)
    }

    /// Worker-reported failure.
    pub async fn fail(
        &self,
        task_id: &str,
        worker_id: &str,
        error_summary: &str,
        output_text: &str,
    ) -> Result<Task, StoreError> {
        let task = self.owned_task(task_id, worker_id).await?;

        if task.status == TaskStatus::Cancelled {
            return self.late_report(task, output_text).await;
        }

        self.finish_failed(task, error_summary, output_text, Outcome::Failure)
            .await
    }

    /// Fail a task without an ownership check. Used by the sweeper when a
    /// worker goes offline and can no longer report for itself.
    pub async fn force_fail(&self, task_id: &str, error_summary: &str) -> Result<Task, StoreError> {
        let task = self.store.get_task(task_id).await?;
        self.finish_failed(task, error_summary, "", Outcome::Failure)
            .await
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Fetch the task and verify the reporting worker holds the claim.
    async fn owned_task(&self, task_id: &str, worker_id: &str) -> Result<Task, StoreError> {
        let task = self.store.get_task(task_id).await?;
        if task.claimed_by_worker.as_deref() != Some(worker_id) {
            return Err(StoreError::Forbidden(format!(
                "task {task_id} is not claimed by worker {worker_id}"
            )));
        }
        Ok(task)
    }

    /// Terminal report on an already-cancelled task: keep the status, but
    /// still attach any captured output.
    async fn late_report(&self, task: Task, output_text: &str) -> Result<Task, StoreError> {
        self.attach_output(task, output_text).await
    }

    async fn finish_failed(
        &self,
        task: Task,
        error_summary: &str,
        output_text: &str,
        outcome: Outcome,
    ) -> Result<Task, StoreError> {
        let task_id = task.id.clone();
        let task = match self
            .store
            .transition_task(
                &task_id,
                &[TaskStatus::Running, TaskStatus::Claimed],
                TaskStatus::Failed,
                TaskFields {
                    error_summary: Some(error_summary.to_string()),
                    set_completed_at: true,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(task) => task,
            Err(StoreError::Conflict(_)) => {
                let task = self.store.get_task(&task_id).await?;
                if task.status == TaskStatus::Cancelled {
                    return self.late_report(task, output_text).await;
                }
                return Err(StoreError::Conflict(format!(
                    "task {task_id} is {}, cannot fail",
                    task.status.as_str()
                )));
            }
            Err(e) => return Err(e),
        };

        let task = self.attach_output(task, output_text).await?;
        if let Some(card_id) = &task.card_id {
            self.store
                .set_card_agent_status(card_id, AgentStatus::Failed)
                .await?;
        }

        info!(task_id = %task.id, error_summary, "Task failed");
        self.bus
            .publish_to_board(&task.board_id, Event::TaskFailed { task: task.clone() });
        self.automation.on_terminal(&task, outcome).await;
        Ok(task)
    }

    /// Attach non-empty output as an agent comment on the card.
    async fn attach_output(&self, mut task: Task, output_text: &str) -> Result<Task, StoreError> {
        if output_text.is_empty() {
            return Ok(task);
        }
        let Some(card_id) = task.card_id.clone() else {
            return Ok(task);
        };

        let comment = self
            .store
            .insert_comment(&card_id, &task.created_by, output_text, true)
            .await?;
        self.store.set_output_comment(&task.id, &comment.id).await?;
        task.output_comment_id = comment.id;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_matches_first_line_word_bounded() {
        assert!(is_rejection("REJECTED: missing tests"));
        assert!(is_rejection("rejected"));
        assert!(is_rejection("Review result: REJECTED"));
        assert!(is_rejection("the build FAILED badly"));
        assert!(is_rejection("Failed to satisfy requirements"));
    }

    #[test]
    fn rejection_ignores_later_lines_and_substrings() {
        assert!(!is_rejection("APPROVED\nbut earlier draft was REJECTED"));
        assert!(!is_rejection("UNREJECTED work"));
        assert!(!is_rejection("failedness everywhere, but no whole word"));
        assert!(!is_rejection(""));
        assert!(!is_rejection("All good: APPROVED"));
    }
}

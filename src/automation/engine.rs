//! Automation engine — card entry into an auto-run column creates a task;
//! a terminal task transition routes the card onward.
//!
//! Chains iterate rather than recurse: each terminal transition performs at
//! most one move and one trigger, the next link runs when the worker
//! finishes the newly created task. The loop bound on (card, column) pairs
//! is the only cycle breaker; the column graph itself may be cyclic.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::StoreError;
use crate::events::{Event, EventBus};
use crate::store::model::{AgentStatus, Card, Column, NewTask, Task, TaskType};
use crate::store::Store;

use super::prompt::{render_prompt, PromptContext};

/// How a task ended, as far as routing is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Hard failure: route to the failure column, never re-trigger there
    /// (circuit breaker).
    Failure,
    /// Reviewer rejection reported through `complete`: routes like a
    /// failure but re-triggers the destination so review loops work
    /// without a structured return channel. The loop count is the bound.
    Rejection,
}

impl Outcome {
    fn is_failure_path(&self) -> bool {
        matches!(self, Outcome::Failure | Outcome::Rejection)
    }

    /// Whether an auto-run destination should trigger a new task.
    fn retriggers(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::Rejection)
    }
}

pub struct AutomationEngine {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
}

impl AutomationEngine {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// A user (or routing) moved a card. Performs the version-conditional
    /// move, publishes `card_moved`, and triggers automation on the
    /// destination column.
    pub async fn user_move_card(
        &self,
        card_id: &str,
        to_column_id: &str,
        actor: &str,
    ) -> Result<Card, StoreError> {
        let card = self.store.get_card(card_id).await?;
        let from_column = card.column_id.clone();
        let moved = self
            .store
            .move_card(card_id, to_column_id, card.version)
            .await?;

        self.bus.publish_to_board(
            &moved.board_id,
            Event::CardMoved {
                card_id: card_id.to_string(),
                from_column: from_column.clone(),
                to_column: to_column_id.to_string(),
                card: moved.clone(),
            },
        );

        if from_column != to_column_id {
            let column = self.store.get_column(to_column_id).await?;
            self.maybe_trigger_on_move(&moved, &column, actor).await?;
        }

        Ok(moved)
    }

    /// Create an agent task if the column the card just entered is an
    /// automation column and the loop bound has room. Returns the created
    /// task, or `None` when no automation applies.
    pub async fn maybe_trigger_on_move(
        &self,
        card: &Card,
        column: &Column,
        actor: &str,
    ) -> Result<Option<Task>, StoreError> {
        if !column.auto_run || column.agent_type.is_empty() {
            return Ok(None);
        }

        let loop_count = self.store.count_tasks_for(&card.id, &column.id).await?;
        if loop_count >= column.max_loop_count {
            // Loop exhausted: unlock the card for manual intervention and
            // stop the chain here.
            info!(
                card_id = %card.id,
                column_id = %column.id,
                loop_count,
                "Automation loop bound reached"
            );
            self.store
                .set_card_agent_status(&card.id, AgentStatus::None)
                .await?;
            return Ok(None);
        }

        let board_name = self
            .store
            .get_board_name(&card.board_id)
            .await
            .unwrap_or_default();
        let comments = self.store.list_comments(&card.id).await?;
        let last_agent_output = self
            .store
            .last_agent_comment(&card.id)
            .await?
            .map(|c| c.content)
            .unwrap_or_default();

        let prompt = render_prompt(
            &column.prompt_template,
            &PromptContext {
                card,
                column,
                board_name: &board_name,
                comments: &comments,
                last_agent_output: &last_agent_output,
            },
        );

        let mut new = NewTask::new(TaskType::AgentRun, card.board_id.clone(), actor);
        new.card_id = Some(card.id.clone());
        new.assigned_to = Some(
            card.assignee_id
                .clone()
                .unwrap_or_else(|| actor.to_string()),
        );
        new.agent_type = column.agent_type.clone();
        new.agent_model = column.agent_model.clone();
        new.prompt_text = prompt;
        new.source_column_id = column.id.clone();
        new.target_column_id = column.on_success_column_id.clone();
        new.failure_column_id = column.on_failure_column_id.clone();
        new.loop_count = loop_count;
        new.max_loop_count = column.max_loop_count;

        let task = crate::tasks::service::create_and_publish(&*self.store, &self.bus, &new).await?;
        info!(
            task_id = %task.id,
            card_id = %card.id,
            agent_type = %column.agent_type,
            "Automation task created"
        );
        Ok(Some(task))
    }

    /// Route a card after its task reached a terminal state. Never fails
    /// the caller: routing problems degrade to a `task_routing_skipped`
    /// diagnostic so a completed task is never undone downstream.
    pub async fn on_terminal(&self, task: &Task, outcome: Outcome) {
        let Some(card_id) = task.card_id.as_deref() else {
            return;
        };

        if let Err(e) = self.route(task, card_id, outcome).await {
            warn!(task_id = %task.id, error = %e, "Routing failed, skipping");
            self.publish_skipped(task, card_id, &e.to_string());
        }
    }

    async fn route(
        &self,
        task: &Task,
        card_id: &str,
        outcome: Outcome,
    ) -> Result<(), StoreError> {
        let card = self.store.get_card(card_id).await?;

        // The card moved out-of-band while the task was running; a stale
        // task must not hijack a human-initiated move.
        if card.column_id != task.source_column_id {
            self.publish_skipped(task, card_id, "card moved out of source column");
            return Ok(());
        }

        let target_id = if outcome.is_failure_path() {
            &task.failure_column_id
        } else {
            &task.target_column_id
        };
        if target_id.is_empty() {
            return Ok(());
        }
        let target = match self.store.get_column(target_id).await {
            Ok(col) => col,
            Err(StoreError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        let moved = match self.store.move_card(card_id, target_id, card.version).await {
            Ok(card) => card,
            Err(StoreError::Conflict(_)) => {
                // Lost the move race: same stale-task rule applies.
                self.publish_skipped(task, card_id, "card moved concurrently");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.bus.publish_to_board(
            &moved.board_id,
            Event::CardMoved {
                card_id: card_id.to_string(),
                from_column: task.source_column_id.clone(),
                to_column: target_id.clone(),
                card: moved.clone(),
            },
        );

        // Success and rejection chain onward; hard-failure destinations
        // never auto-trigger.
        if outcome.retriggers() && target.auto_run {
            self.maybe_trigger_on_move(&moved, &target, &task.created_by)
                .await?;
        }

        Ok(())
    }

    fn publish_skipped(&self, task: &Task, card_id: &str, reason: &str) {
        self.bus.publish_to_board(
            &task.board_id,
            Event::TaskRoutingSkipped {
                task_id: task.id.clone(),
                card_id: card_id.to_string(),
                reason: reason.to_string(),
            },
        );
    }
}

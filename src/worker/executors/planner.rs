//! Planner executor — decomposes a natural-language request into board
//! structure.
//!
//! `board_plan` creates the standard pipeline columns and fills the first
//! one with AI-generated cards; `card_gen` only generates cards into an
//! existing column. The AI controls card content, never column structure.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::ExecutorError;
use crate::store::model::{Task, TaskType};
use crate::worker::client::ServerClient;
use crate::worker::config::WorkerConfig;

use super::agent::{run_cli, ProgressReporter};

/// Standard pipeline created for every planned board, in position order.
const PIPELINE_COLUMNS: &[(&str, &str, bool)] = &[
    ("Plan", "", false),
    ("Architect", "architect", true),
    ("Code", "coder", true),
    ("Review", "reviewer", true),
    ("Done", "", false),
];

/// Instruction appended to the user's prompt to get parseable output.
const CARD_LIST_INSTRUCTION: &str = "\n\nRespond with ONLY a JSON array of cards, each an object \
     with \"title\", \"description\", and \"priority\" (low|medium|high) fields.";

/// First JSON array in a blob of CLI output.
static JSON_ARRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[\s*\{.*?\}\s*\]").unwrap());

#[derive(Debug, Deserialize)]
struct PlannedCard {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_priority")]
    priority: String,
}

fn default_priority() -> String {
    "medium".to_string()
}

/// Pull a card list out of agent output that may carry prose or fencing
/// around the JSON.
fn parse_cards(output: &str) -> Result<Vec<PlannedCard>, ExecutorError> {
    let candidate = JSON_ARRAY
        .find(output)
        .map(|m| m.as_str())
        .ok_or_else(|| {
            ExecutorError::Payload("planner output contains no JSON card array".to_string())
        })?;
    serde_json::from_str(candidate)
        .map_err(|e| ExecutorError::Payload(format!("planner output is not valid JSON: {e}")))
}

/// Executes `board_plan` and `card_gen` tasks.
pub struct PlannerExecutor {
    config: WorkerConfig,
    server: Arc<ServerClient>,
    worker_id: String,
}

impl PlannerExecutor {
    pub fn new(config: WorkerConfig, server: Arc<ServerClient>, worker_id: String) -> Self {
        Self {
            config,
            server,
            worker_id,
        }
    }

    pub async fn execute(&self, task: &Task) {
        let result = match task.task_type {
            TaskType::BoardPlan => self.board_plan(task).await,
            TaskType::CardGen => self.card_gen(task).await,
            other => Err(ExecutorError::Payload(format!(
                "not a planner task: {}",
                other.as_str()
            ))),
        };

        match result {
            Ok(summary) => {
                info!(task_id = %task.id, "Planner task done");
                if let Err(e) = self
                    .server
                    .complete_task(&task.id, &self.worker_id, &summary)
                    .await
                {
                    warn!(task_id = %task.id, error = %e, "Failed to report completion");
                }
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Planner task failed");
                if let Err(report_err) = self
                    .server
                    .fail_task(&task.id, &self.worker_id, &e.to_string(), "")
                    .await
                {
                    warn!(task_id = %task.id, error = %report_err, "Failed to report failure");
                }
            }
        }
    }

    /// Generate cards from the prompt via the agent CLI.
    async fn generate_cards(&self, task: &Task) -> Result<Vec<PlannedCard>, ExecutorError> {
        if task.prompt_text.is_empty() {
            return Err(ExecutorError::Payload("planner task has no prompt".to_string()));
        }

        let reporter = ProgressReporter::new(Arc::clone(&self.server), &task.id, &self.worker_id);
        reporter.send("Planning board structure...").await;

        let prompt = format!("{}{CARD_LIST_INSTRUCTION}", task.prompt_text);
        let mut output = Vec::new();
        run_cli(
            &self.config,
            "architect",
            &task.agent_model,
            &prompt,
            &mut output,
            Some(&reporter),
        )
        .await?;

        parse_cards(&output.join("\n"))
    }

    /// `board_plan`: create the pipeline columns, wire routing, fill the
    /// first column with cards.
    async fn board_plan(&self, task: &Task) -> Result<String, ExecutorError> {
        let cards = self.generate_cards(task).await?;

        // Create columns back-to-front so each auto-run column can point
        // its success target at an id that already exists.
        let mut created_rev: Vec<crate::store::model::Column> = Vec::new();
        for (position, (name, agent_type, auto_run)) in
            PIPELINE_COLUMNS.iter().enumerate().rev()
        {
            let on_success = created_rev
                .last()
                .map(|c| c.id.clone())
                .unwrap_or_default();
            let column = self
                .server
                .create_column(
                    &task.board_id,
                    json!({
                        "name": name,
                        "position": position,
                        "auto_run": auto_run,
                        "agent_type": agent_type,
                        "on_success_column_id": if *auto_run { on_success } else { String::new() },
                    }),
                )
                .await
                .map_err(|e| ExecutorError::Integration(format!("create column: {e}")))?;
            created_rev.push(column);
        }

        // Wire the review column's failure path back to the coding column.
        let review = created_rev.iter().find(|c| c.name == "Review");
        let code = created_rev.iter().find(|c| c.name == "Code");
        if let (Some(review), Some(code)) = (review, code) {
            self.server
                .update_column_routing(&review.id, None, Some(&code.id))
                .await
                .map_err(|e| ExecutorError::Integration(format!("wire failure route: {e}")))?;
        }

        let plan_column = created_rev
            .iter()
            .find(|c| c.name == "Plan")
            .ok_or_else(|| ExecutorError::Integration("plan column missing".to_string()))?;

        for card in &cards {
            self.server
                .create_card(&plan_column.id, &card.title, &card.description, &card.priority, &[])
                .await
                .map_err(|e| ExecutorError::Integration(format!("create card: {e}")))?;
        }

        Ok(format!(
            "Planned board with {} columns and {} cards",
            PIPELINE_COLUMNS.len(),
            cards.len()
        ))
    }

    /// `card_gen`: generate cards into an existing column.
    async fn card_gen(&self, task: &Task) -> Result<String, ExecutorError> {
        let target_column_id = task
            .payload
            .get("target_column_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ExecutorError::Payload("card_gen payload missing target_column_id".to_string())
            })?;

        let cards = self.generate_cards(task).await?;
        for card in &cards {
            self.server
                .create_card(target_column_id, &card.title, &card.description, &card.priority, &[])
                .await
                .map_err(|e| ExecutorError::Integration(format!("create card: {e}")))?;
        }

        Ok(format!("Generated {} cards", cards.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json_array() {
        let cards = parse_cards(
            r#"[{"title": "Set up CI", "description": "GitHub Actions", "priority": "high"}]"#,
        )
        .unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].title, "Set up CI");
        assert_eq!(cards[0].priority, "high");
    }

    #[test]
    fn parses_array_surrounded_by_prose() {
        let output = "Here is the plan:\n```json\n[{\"title\": \"A\"}, {\"title\": \"B\"}]\n```\nDone.";
        let cards = parse_cards(output).unwrap();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[1].title, "B");
        assert_eq!(cards[1].priority, "medium");
    }

    #[test]
    fn rejects_output_without_cards() {
        assert!(parse_cards("no json here").is_err());
        assert!(parse_cards("[1, 2, 3]").is_err());
    }
}

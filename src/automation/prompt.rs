//! Prompt template rendering for automation columns.

use crate::store::model::{Card, Column, Comment};

/// Template used when a column has no `prompt_template` of its own.
pub const DEFAULT_PROMPT_TEMPLATE: &str = "You are a {agent_type} agent. Card: {card_title}\n\n\
     {card_description}\n\nPrevious output:\n{last_agent_output}\n\n\
     Perform your role; if reviewing, state APPROVED or REJECTED.";

/// Everything a template can reference.
pub struct PromptContext<'a> {
    pub card: &'a Card,
    pub column: &'a Column,
    pub board_name: &'a str,
    pub comments: &'a [Comment],
    pub last_agent_output: &'a str,
}

/// Render a prompt template with card/column variables.
///
/// Supported variables: `{card_title}`, `{card_description}`,
/// `{card_labels}`, `{card_priority}`, `{card_comments}`,
/// `{last_agent_output}`, `{column_name}`, `{board_name}`, `{agent_type}`.
/// Unknown variables are left literal. An empty template falls back to
/// [`DEFAULT_PROMPT_TEMPLATE`].
pub fn render_prompt(template: &str, ctx: &PromptContext<'_>) -> String {
    let template = if template.is_empty() {
        DEFAULT_PROMPT_TEMPLATE
    } else {
        template
    };

    let comments = ctx
        .comments
        .iter()
        .map(|c| {
            format!(
                "[{}] {}: {}",
                c.created_at.to_rfc3339(),
                c.user_id,
                c.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let variables: &[(&str, String)] = &[
        ("{card_title}", ctx.card.title.clone()),
        ("{card_description}", ctx.card.description.clone()),
        ("{card_labels}", ctx.card.labels.join(", ")),
        ("{card_priority}", ctx.card.priority.clone()),
        ("{card_comments}", comments),
        ("{last_agent_output}", ctx.last_agent_output.to_string()),
        ("{column_name}", ctx.column.name.clone()),
        ("{board_name}", ctx.board_name.to_string()),
        ("{agent_type}", ctx.column.agent_type.clone()),
    ];

    let mut result = template.to_string();
    for (key, value) in variables {
        result = result.replace(key, value);
    }
    result
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::store::model::AgentStatus;

    use super::*;

    fn card() -> Card {
        Card {
            id: "c1".into(),
            column_id: "col1".into(),
            board_id: "b1".into(),
            title: "Design login".into(),
            description: "OAuth2".into(),
            labels: vec!["auth".into(), "backend".into()],
            priority: "high".into(),
            assignee_id: None,
            agent_status: AgentStatus::None,
            position: 0,
            version: 0,
        }
    }

    fn column(template: &str) -> Column {
        Column {
            id: "col1".into(),
            board_id: "b1".into(),
            name: "Plan".into(),
            position: 0,
            auto_run: true,
            agent_type: "architect".into(),
            agent_model: "smart".into(),
            prompt_template: template.into(),
            on_success_column_id: String::new(),
            on_failure_column_id: String::new(),
            max_loop_count: 3,
        }
    }

    #[test]
    fn renders_card_variables() {
        let card = card();
        let column = column("Task: {card_title} ({card_priority}) labels={card_labels}");
        let ctx = PromptContext {
            card: &card,
            column: &column,
            board_name: "Sprint",
            comments: &[],
            last_agent_output: "",
        };
        let prompt = render_prompt(&column.prompt_template, &ctx);
        assert_eq!(prompt, "Task: Design login (high) labels=auth, backend");
    }

    #[test]
    fn empty_template_uses_default() {
        let card = card();
        let column = column("");
        let ctx = PromptContext {
            card: &card,
            column: &column,
            board_name: "Sprint",
            comments: &[],
            last_agent_output: "Use OIDC",
        };
        let prompt = render_prompt("", &ctx);
        assert!(prompt.contains("You are a architect agent"));
        assert!(prompt.contains("Design login"));
        assert!(prompt.contains("OAuth2"));
        assert!(prompt.contains("Use OIDC"));
        assert!(prompt.contains("APPROVED or REJECTED"));
    }

    #[test]
    fn unknown_variables_stay_literal() {
        let card = card();
        let column = column("{card_title} and {mystery_var}");
        let ctx = PromptContext {
            card: &card,
            column: &column,
            board_name: "Sprint",
            comments: &[],
            last_agent_output: "",
        };
        let prompt = render_prompt(&column.prompt_template, &ctx);
        assert_eq!(prompt, "Design login and {mystery_var}");
    }

    #[test]
    fn comments_include_author_and_timestamp() {
        let card = card();
        let column = column("{card_comments}");
        let comments = vec![Comment {
            id: "cm1".into(),
            card_id: "c1".into(),
            user_id: "alice".into(),
            content: "looks good".into(),
            is_agent_output: false,
            created_at: Utc::now(),
        }];
        let ctx = PromptContext {
            card: &card,
            column: &column,
            board_name: "Sprint",
            comments: &comments,
            last_agent_output: "",
        };
        let prompt = render_prompt(&column.prompt_template, &ctx);
        assert!(prompt.contains("alice: looks good"));
        assert!(prompt.contains('['));
    }
}

//! Task executors. Dispatch is by task type: `agent_run` spawns the
//! agent CLI, `jira_*`/`gitlab_*` call the respective REST APIs with
//! locally-stored credentials, planner types drive the CLI and create
//! board structure through the server.

pub mod agent;
pub mod gitlab;
pub mod jira;
pub mod planner;

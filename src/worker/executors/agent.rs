//! Agent executor — runs the agent CLI as a subprocess and reports results.
//!
//! The subprocess is a scoped resource: the prompt goes in on stdin,
//! stdout is streamed line-buffered with terminal chrome stripped, and on
//! every exit path (success, timeout, cancellation, shutdown) the child
//! is terminated, given a short grace period, then force-killed. Progress
//! is reported every N lines or T seconds, whichever comes first.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ExecutorError;
use crate::store::model::Task;
use crate::worker::client::ServerClient;
use crate::worker::config::WorkerConfig;

/// Report progress after this many output lines…
const PROGRESS_EVERY_LINES: u32 = 20;
/// …or after this long, whichever comes first.
const PROGRESS_EVERY: Duration = Duration::from_secs(2);
/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// ANSI escape sequences and carriage returns (spinner redraws).
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[a-zA-Z]|\x1b\][^\x07]*\x07|\x1b[()][AB012]|\r").unwrap()
});

/// Terminal chrome the CLI prints around the useful output.
static CHROME_FILTERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Box-drawing banners
        r"^[─│┌┐└┘├┤┬┴┼═║╔╗╚╝╠╣╦╩╬█▀▄░▒▓\s]+$",
        // Model banner line
        r"^Model:\s*",
        // Tool execution log lines
        r"^(Reading|Writing|Executing|Running|Creating|Deleting)\s+",
        // Spinner artifacts
        r"^[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏\s]+$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Strip ANSI codes and filter chrome. Returns `None` for lines that
/// carry no content.
pub fn clean_line(raw: &str) -> Option<String> {
    let line = ANSI_ESCAPE.replace_all(raw, "");
    if line.trim().is_empty() {
        return None;
    }
    for filter in CHROME_FILTERS.iter() {
        if filter.is_match(&line) {
            return None;
        }
    }
    Some(line.into_owned())
}

/// Reports progress for one task, swallowing transport errors so a flaky
/// report never interrupts execution.
pub struct ProgressReporter {
    server: Arc<ServerClient>,
    task_id: String,
    worker_id: String,
}

impl ProgressReporter {
    pub fn new(server: Arc<ServerClient>, task_id: &str, worker_id: &str) -> Self {
        Self {
            server,
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
        }
    }

    pub async fn send(&self, text: &str) {
        if let Err(e) = self
            .server
            .report_progress(&self.task_id, &self.worker_id, text)
            .await
        {
            debug!(task_id = %self.task_id, error = %e, "Progress report failed");
        }
    }
}

/// Locate the agent CLI binary: explicit paths are used as-is, bare
/// names are resolved against PATH.
fn find_cli(name: &str) -> Result<std::path::PathBuf, ExecutorError> {
    let candidate = std::path::Path::new(name);
    if candidate.components().count() > 1 {
        if candidate.exists() {
            return Ok(candidate.to_path_buf());
        }
        return Err(ExecutorError::CliNotFound(name.to_string()));
    }

    let path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path) {
        let full = dir.join(name);
        if full.is_file() {
            return Ok(full);
        }
    }
    Err(ExecutorError::CliNotFound(name.to_string()))
}

/// Send SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!("Subprocess ignored SIGTERM, killing");
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Run the agent CLI with `prompt` on stdin, streaming cleaned output
/// lines into `output` and reporting progress when `reporter` is given.
///
/// `output` accumulates even on failure so partial output can be
/// attached to the failure report.
pub async fn run_cli(
    config: &WorkerConfig,
    agent_type: &str,
    agent_model: &str,
    prompt: &str,
    output: &mut Vec<String>,
    reporter: Option<&ProgressReporter>,
) -> Result<(), ExecutorError> {
    let cli = find_cli(&config.agent_cli)?;

    // Agent selection travels via environment so the flag surface stays
    // whatever `agent_cli_args` says the CLI accepts.
    let mut command = Command::new(&cli);
    if !agent_type.is_empty() {
        command.env("AGENTBOARD_AGENT", agent_type);
    }
    if !agent_model.is_empty() {
        command.env("AGENTBOARD_MODEL", agent_model);
    }
    command
        .args(&config.agent_cli_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| ExecutorError::Spawn(e.to_string()))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(prompt.as_bytes()).await?;
        // Closing stdin signals end of input to the CLI.
        drop(stdin);
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecutorError::Spawn("stdout not captured".to_string()))?;
    let mut lines = BufReader::new(stdout).lines();

    let deadline = Instant::now() + config.agent_timeout;
    let mut line_count: u32 = 0;
    let mut last_report = Instant::now();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::time::sleep_until(deadline) => {
                terminate(&mut child).await;
                return Err(ExecutorError::Timeout(config.agent_timeout));
            }
        };
        let Some(line) = line else {
            break; // stdout closed
        };

        if let Some(clean) = clean_line(&line) {
            output.push(clean);
            line_count += 1;

            if line_count % PROGRESS_EVERY_LINES == 0 || last_report.elapsed() >= PROGRESS_EVERY {
                if let Some(reporter) = reporter {
                    reporter
                        .send(&format!("Running... ({line_count} lines)"))
                        .await;
                }
                last_report = Instant::now();
            }
        }
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    let status = match tokio::time::timeout(remaining, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            terminate(&mut child).await;
            return Err(ExecutorError::Timeout(config.agent_timeout));
        }
    };

    if !status.success() {
        let last_line = output.last().cloned().unwrap_or_default();
        return Err(ExecutorError::NonZeroExit {
            code: status.code().unwrap_or(-1),
            last_line,
        });
    }
    if output.iter().all(|l| l.trim().is_empty()) {
        return Err(ExecutorError::EmptyOutput);
    }
    Ok(())
}

/// Executes `agent_run` tasks.
pub struct AgentExecutor {
    config: WorkerConfig,
    server: Arc<ServerClient>,
    worker_id: String,
}

impl AgentExecutor {
    pub fn new(config: WorkerConfig, server: Arc<ServerClient>, worker_id: String) -> Self {
        Self {
            config,
            server,
            worker_id,
        }
    }

    /// Run the CLI for this task and report the outcome. Never returns an
    /// error: executor failures become `fail` reports.
    pub async fn execute(&self, task: &Task) {
        let task_id = &task.id;
        let agent_type = if task.agent_type.is_empty() {
            "general"
        } else {
            task.agent_type.as_str()
        };

        if task.prompt_text.is_empty() {
            self.report_fail(task_id, "Task has no prompt text", "").await;
            return;
        }

        let reporter = ProgressReporter::new(Arc::clone(&self.server), task_id, &self.worker_id);
        reporter
            .send(&format!("Starting {agent_type} agent..."))
            .await;

        let mut output = Vec::new();
        let result = run_cli(
            &self.config,
            agent_type,
            &task.agent_model,
            &task.prompt_text,
            &mut output,
            Some(&reporter),
        )
        .await;

        let output_text = output.join("\n");
        match result {
            Ok(()) => {
                info!(task_id, agent_type, output_len = output_text.len(), "Agent task done");
                if let Err(e) = self
                    .server
                    .complete_task(task_id, &self.worker_id, &output_text)
                    .await
                {
                    warn!(task_id, error = %e, "Failed to report completion");
                }
            }
            Err(e) => {
                warn!(task_id, agent_type, error = %e, "Agent task failed");
                self.report_fail(task_id, &e.to_string(), &output_text).await;
            }
        }
    }

    async fn report_fail(&self, task_id: &str, error_summary: &str, output_text: &str) {
        if let Err(e) = self
            .server
            .fail_task(task_id, &self.worker_id, error_summary, output_text)
            .await
        {
            warn!(task_id, error = %e, "Failed to report failure");
        }
    }
}

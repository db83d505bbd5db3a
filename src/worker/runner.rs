//! Worker runner — the daemon's two concurrent loops.
//!
//! The poll loop fetches and claims pending tasks while capacity allows;
//! the heartbeat loop keeps the server-side liveness fresh and applies
//! cancel directives. Shutdown stops polling, aborts in-flight
//! executions (their subprocesses die with them), and reports each as
//! failed with a shutdown summary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::store::model::{Task, TaskType};
use crate::worker::client::ServerClient;
use crate::worker::config::{WorkerConfig, WORKER_VERSION};
use crate::worker::executors::agent::AgentExecutor;
use crate::worker::executors::gitlab::GitLabExecutor;
use crate::worker::executors::jira::JiraExecutor;
use crate::worker::executors::planner::PlannerExecutor;

/// Capabilities advertised on registration.
const CAPABILITIES: &[&str] = &["agent", "jira", "gitlab", "board_plan", "card_gen"];

pub struct WorkerRunner {
    config: WorkerConfig,
    server: Arc<ServerClient>,
    worker_id: String,
    /// In-flight executions by task id.
    in_flight: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerRunner {
    /// Register with the server and build a runner. Server directives
    /// (poll interval, concurrency) override the local config.
    pub async fn register(
        mut config: WorkerConfig,
        server: Arc<ServerClient>,
    ) -> Result<Self, ApiError> {
        let hostname = hostname();
        let registration = server
            .register(&hostname, WORKER_VERSION, CAPABILITIES)
            .await?;

        config.poll_interval = std::time::Duration::from_secs(registration.poll_interval_seconds);
        config.heartbeat_interval =
            std::time::Duration::from_secs(registration.heartbeat_interval_seconds);
        config.max_concurrent_tasks = registration.max_concurrent_tasks.max(1);

        info!(
            worker_id = %registration.worker_id,
            hostname,
            max_concurrent = config.max_concurrent_tasks,
            "Worker registered"
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            server,
            worker_id: registration.worker_id,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run both loops until shutdown is requested.
    pub async fn run(&self) {
        tokio::join!(self.poll_loop(), self.heartbeat_loop());
    }

    /// Stop accepting tasks, abort in-flight executions, and report each
    /// as failed so the server can route the cards.
    pub async fn shutdown(&self) {
        info!("Worker shutting down");
        let _ = self.shutdown_tx.send(true);

        let aborted: Vec<(String, JoinHandle<()>)> = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.drain().collect()
        };

        for (task_id, handle) in aborted {
            let was_running = !handle.is_finished();
            // kill_on_drop on the subprocess makes abort sufficient.
            handle.abort();
            let _ = handle.await;
            if !was_running {
                continue;
            }
            if let Err(e) = self
                .server
                .fail_task(&task_id, &self.worker_id, "worker shutdown", "")
                .await
            {
                warn!(task_id, error = %e, "Failed to report shutdown failure");
            }
        }
        info!("Worker stopped");
    }

    // ── Poll loop ───────────────────────────────────────────────────

    async fn poll_loop(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut backoff_cycles: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let interval = self.config.poll_interval * (1 + backoff_cycles);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
            backoff_cycles = 0;

            self.reap_finished();

            let capacity = {
                let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                self.config
                    .max_concurrent_tasks
                    .saturating_sub(in_flight.len() as u32)
            };
            if capacity == 0 {
                continue;
            }

            let tasks = match self.server.poll_tasks(&self.worker_id, capacity).await {
                Ok(tasks) => tasks,
                Err(e) if e.is_rate_limited() => {
                    debug!("Poll rate-limited, backing off one cycle");
                    backoff_cycles = 1;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Poll failed");
                    continue;
                }
            };

            for task in tasks {
                self.try_start(task).await;
            }
        }
    }

    /// Claim a task and spawn its executor. A claim conflict means
    /// another worker won; skip quietly.
    async fn try_start(&self, task: Task) {
        {
            let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if in_flight.contains_key(&task.id) {
                return;
            }
        }

        let claimed = match self.server.claim_task(&task.id, &self.worker_id).await {
            Ok(task) => task,
            Err(e) if e.is_conflict() => {
                debug!(task_id = %task.id, "Task already claimed, skipping");
                return;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Claim failed");
                return;
            }
        };

        info!(task_id = %claimed.id, task_type = claimed.task_type.as_str(), "Task claimed");

        let config = self.config.clone();
        let server = Arc::clone(&self.server);
        let worker_id = self.worker_id.clone();
        let handle = tokio::spawn(async move {
            dispatch(config, server, worker_id, claimed).await;
        });

        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id, handle);
    }

    /// Drop completed handles from the in-flight map.
    fn reap_finished(&self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.retain(|task_id, handle| {
            if handle.is_finished() {
                debug!(task_id, "Execution finished");
                false
            } else {
                true
            }
        });
    }

    // ── Heartbeat loop ──────────────────────────────────────────────

    async fn heartbeat_loop(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                _ = shutdown.changed() => break,
            }

            let running_ids: Vec<String> = {
                let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                in_flight.keys().cloned().collect()
            };

            let directives = match self
                .server
                .heartbeat(&self.worker_id, &running_ids, system_load())
                .await
            {
                Ok(directives) => directives,
                Err(e) => {
                    warn!(error = %e, "Heartbeat failed");
                    continue;
                }
            };

            for task_id in directives.cancel_task_ids {
                self.cancel_local(&task_id).await;
            }
        }
    }

    /// Abort a local execution the server cancelled. The terminal report
    /// is a no-op server-side but still flushes any captured output.
    async fn cancel_local(&self, task_id: &str) {
        let handle = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.remove(task_id)
        };
        let Some(handle) = handle else {
            return;
        };

        info!(task_id, "Server requested cancellation");
        handle.abort();
        let _ = handle.await;
        if let Err(e) = self
            .server
            .fail_task(task_id, &self.worker_id, "cancelled by server", "")
            .await
        {
            debug!(task_id, error = %e, "Cancellation report failed");
        }
    }
}

/// Route a claimed task to its executor.
async fn dispatch(config: WorkerConfig, server: Arc<ServerClient>, worker_id: String, task: Task) {
    match task.task_type {
        TaskType::AgentRun => {
            AgentExecutor::new(config, server, worker_id)
                .execute(&task)
                .await
        }
        t if t.is_jira() => {
            JiraExecutor::new(config, server, worker_id)
                .execute(&task)
                .await
        }
        t if t.is_gitlab() => {
            GitLabExecutor::new(config, server, worker_id)
                .execute(&task)
                .await
        }
        t if t.is_planner() => {
            PlannerExecutor::new(config, server, worker_id)
                .execute(&task)
                .await
        }
        other => {
            warn!(task_id = %task.id, task_type = other.as_str(), "No executor for task type");
            let _ = server
                .fail_task(
                    &task.id,
                    &worker_id,
                    &format!("unknown task type: {}", other.as_str()),
                    "",
                )
                .await;
        }
    }
}

/// Machine hostname reported on registration.
fn hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            if let Ok(name) = name.into_string() {
                return name;
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// 1-minute load average, best effort.
fn system_load() -> f64 {
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse().ok()))
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_is_nonempty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn system_load_is_finite() {
        assert!(system_load().is_finite());
        assert!(system_load() >= 0.0);
    }
}

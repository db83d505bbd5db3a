//! Worker daemon configuration.

use std::time::Duration;

/// Version string reported to the server on registration.
pub const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration for the local worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the server, e.g. `http://localhost:8000`.
    pub server_url: String,
    /// Seconds between task polls. The server may override on register.
    pub poll_interval: Duration,
    /// Seconds between heartbeats.
    pub heartbeat_interval: Duration,
    /// Parallel task cap. The server may override on register.
    pub max_concurrent_tasks: u32,
    /// Hard cap on an agent CLI subprocess run.
    pub agent_timeout: Duration,
    /// Agent CLI binary name or path. Resolved from PATH when relative.
    pub agent_cli: String,
    /// Extra flags passed to the agent CLI before the prompt goes in on
    /// stdin.
    pub agent_cli_args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            max_concurrent_tasks: 1,
            agent_timeout: Duration::from_secs(600),
            agent_cli: "agentboard-agent".to_string(),
            agent_cli_args: vec!["--no-interactive".to_string()],
        }
    }
}

impl WorkerConfig {
    /// Build config from environment variables over defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: std::env::var("AGENTBOARD_SERVER").unwrap_or(defaults.server_url),
            poll_interval: env_secs("AGENTBOARD_POLL_INTERVAL")
                .unwrap_or(defaults.poll_interval),
            heartbeat_interval: env_secs("AGENTBOARD_HEARTBEAT_INTERVAL")
                .unwrap_or(defaults.heartbeat_interval),
            max_concurrent_tasks: std::env::var("AGENTBOARD_MAX_CONCURRENT_TASKS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_concurrent_tasks),
            agent_timeout: env_secs("AGENTBOARD_AGENT_TIMEOUT")
                .unwrap_or(defaults.agent_timeout),
            agent_cli: std::env::var("AGENTBOARD_AGENT_CLI").unwrap_or(defaults.agent_cli),
            agent_cli_args: defaults.agent_cli_args,
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_expectations() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.max_concurrent_tasks, 1);
        assert_eq!(config.agent_timeout, Duration::from_secs(600));
    }
}

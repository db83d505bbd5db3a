//! Server configuration and liveness constants.

use std::time::Duration;

/// Heartbeat age after which an online worker is marked stale.
pub const STALE_AFTER: Duration = Duration::from_secs(90);

/// Heartbeat age after which a stale worker is marked offline and its
/// claimed/running tasks are failed.
pub const OFFLINE_AFTER: Duration = Duration::from_secs(300);

/// Error summary written on tasks abandoned by an offline worker.
pub const OFFLINE_ERROR_SUMMARY: &str = "worker offline";

/// Minimum spacing between poll requests from a single worker.
pub const POLL_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Idle time on an event stream before a heartbeat frame is emitted.
pub const STREAM_HEARTBEAT: Duration = Duration::from_secs(15);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:8000`.
    pub listen_addr: String,
    /// Path to the libSQL database file. `:memory:` for ephemeral.
    pub database_path: String,
    /// Sweeper tick interval.
    pub sweep_interval: Duration,
    /// Directives handed to workers on registration.
    pub worker_directives: WorkerDirectives,
}

/// Tunables the server pushes to workers when they register.
#[derive(Debug, Clone, Copy)]
pub struct WorkerDirectives {
    pub max_concurrent_tasks: u32,
    pub poll_interval_seconds: u64,
    pub heartbeat_interval_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8000".to_string(),
            database_path: "agentboard.db".to_string(),
            sweep_interval: Duration::from_secs(30),
            worker_directives: WorkerDirectives {
                max_concurrent_tasks: 1,
                poll_interval_seconds: 5,
                heartbeat_interval_seconds: 30,
            },
        }
    }
}

impl ServerConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: std::env::var("AGENTBOARD_LISTEN")
                .unwrap_or(defaults.listen_addr),
            database_path: std::env::var("AGENTBOARD_DB")
                .unwrap_or(defaults.database_path),
            sweep_interval: std::env::var("AGENTBOARD_SWEEP_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            worker_directives: WorkerDirectives {
                max_concurrent_tasks: std::env::var("AGENTBOARD_MAX_CONCURRENT_TASKS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.worker_directives.max_concurrent_tasks),
                ..defaults.worker_directives
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.worker_directives.max_concurrent_tasks, 1);
        assert_eq!(config.worker_directives.poll_interval_seconds, 5);
    }

    #[test]
    fn liveness_thresholds_are_ordered() {
        assert!(STALE_AFTER < OFFLINE_AFTER);
    }
}

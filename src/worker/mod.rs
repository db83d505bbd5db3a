//! Worker daemon: a single-user process that polls the server for tasks,
//! claims them, executes via the agent CLI or integration clients, and
//! reports results.

pub mod client;
pub mod config;
pub mod executors;
pub mod runner;

pub use client::ServerClient;
pub use config::WorkerConfig;
pub use runner::WorkerRunner;

//! Agentboard — kanban dispatch core.
//!
//! The server side (store, registry, task service, automation engine, event
//! bus, HTTP surface) and the worker daemon (poll/claim loop, executors)
//! live in one crate; `main.rs` and `bin/worker.rs` are the two entry points.

pub mod automation;
pub mod config;
pub mod error;
pub mod events;
pub mod registry;
pub mod server;
pub mod store;
pub mod stream;
pub mod tasks;
pub mod worker;

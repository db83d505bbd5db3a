//! Long-lived client event streams.

pub mod sse;

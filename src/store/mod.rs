//! Persistence layer: row models, the backend-agnostic `Store` trait, and
//! the libSQL implementation with version-tracked migrations.

pub mod libsql;
pub mod migrations;
pub mod model;
pub mod traits;

pub use self::libsql::LibSqlStore;
pub use self::traits::{Store, TaskFields, TaskFilter};

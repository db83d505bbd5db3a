//! Error types for agentboard.

use std::time::Duration;

/// Store-level errors. The taxonomy is fixed: callers match on these
/// variants to pick HTTP status codes, and the underlying engine error
/// never crosses this boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether a retry at the store layer could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Registry-level errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Worker {worker_id} does not belong to user {user_id}")]
    NotOwner { worker_id: String, user_id: String },

    #[error("Poll rate exceeded for worker {worker_id}")]
    RateLimited { worker_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Authentication errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid or expired token")]
    InvalidToken,
}

/// Malformed request bodies or parameters.
#[derive(Debug, thiserror::Error)]
#[error("Protocol error: {0}")]
pub struct ProtocolError(pub String);

/// Worker-side errors when talking to the server.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{method} {path} returned {status}: {detail}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
        detail: String,
    },

    #[error("Cannot reach server: {0}")]
    Connect(String),

    #[error("Request timed out: {method} {path}")]
    Timeout { method: &'static str, path: String },

    #[error("Invalid response body: {0}")]
    Decode(String),
}

impl ApiError {
    /// HTTP status of the response, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Claim races surface as 409 and are expected during normal operation.
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }
}

/// Worker-side execution failures. These are reported to the server via
/// `fail`, not raised as protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Agent CLI not found: {0}")]
    CliNotFound(String),

    #[error("Failed to spawn subprocess: {0}")]
    Spawn(String),

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Subprocess exited with code {code}: {last_line}")]
    NonZeroExit { code: i32, last_line: String },

    #[error("Subprocess produced no output")]
    EmptyOutput,

    #[error("Invalid task payload: {0}")]
    Payload(String),

    #[error("Integration API error: {0}")]
    Integration(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_transience() {
        assert!(StoreError::Storage("locked".into()).is_transient());
        assert!(!StoreError::Conflict("claimed".into()).is_transient());
        assert!(!StoreError::not_found("task", "t1").is_transient());
    }

    #[test]
    fn api_error_conflict_detection() {
        let err = ApiError::Status {
            method: "POST",
            path: "/api/workers/tasks/t1/claim".into(),
            status: 409,
            detail: "Task already claimed".into(),
        };
        assert!(err.is_conflict());
        assert!(!err.is_rate_limited());
        assert!(!ApiError::Connect("refused".into()).is_conflict());
    }
}

//! Error-to-response mapping for handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::{AuthError, ProtocolError, RegistryError, StoreError};

/// A failed request: status code plus a `{"detail": ...}` body.
#[derive(Debug)]
pub struct Failure {
    pub status: StatusCode,
    pub detail: String,
}

impl Failure {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

impl From<StoreError> for Failure {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            StoreError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e.to_string())
    }
}

impl From<RegistryError> for Failure {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotOwner { .. } => Self::new(StatusCode::FORBIDDEN, e.to_string()),
            RegistryError::RateLimited { .. } => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, e.to_string())
            }
            RegistryError::Store(inner) => inner.into(),
        }
    }
}

impl From<AuthError> for Failure {
    fn from(e: AuthError) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, e.to_string())
    }
}

impl From<ProtocolError> for Failure {
    fn from(e: ProtocolError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_expected_codes() {
        let f: Failure = StoreError::not_found("task", "t1").into();
        assert_eq!(f.status, StatusCode::NOT_FOUND);

        let f: Failure = StoreError::Conflict("claimed".into()).into();
        assert_eq!(f.status, StatusCode::CONFLICT);

        let f: Failure = StoreError::Forbidden("not yours".into()).into();
        assert_eq!(f.status, StatusCode::FORBIDDEN);

        let f: Failure = StoreError::Storage("disk".into()).into();
        assert_eq!(f.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn registry_errors_map_to_expected_codes() {
        let f: Failure = RegistryError::RateLimited {
            worker_id: "w1".into(),
        }
        .into();
        assert_eq!(f.status, StatusCode::TOO_MANY_REQUESTS);

        let f: Failure = RegistryError::NotOwner {
            worker_id: "w1".into(),
            user_id: "bob".into(),
        }
        .into();
        assert_eq!(f.status, StatusCode::FORBIDDEN);
    }
}

//! Bearer-token authentication seam.
//!
//! Token issuance and identity storage are external concerns; the server
//! only needs "token → user". `StaticTokenAuth` is the single-box
//! implementation: a fixed user/password table that mints opaque tokens
//! on login. A real identity provider slots in behind the same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::error::AuthError;
use crate::store::model::new_id;

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a bearer token to a user id.
    async fn authenticate(&self, token: &str) -> Result<String, AuthError>;

    /// Exchange credentials for a token.
    async fn login(&self, username: &str, password: &str) -> Result<String, AuthError>;
}

/// In-memory token table. Users with an empty configured password accept
/// any password (demo mode).
pub struct StaticTokenAuth {
    /// username → password ("" accepts anything)
    users: HashMap<String, String>,
    /// token → username
    tokens: Mutex<HashMap<String, String>>,
}

impl StaticTokenAuth {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self {
            users,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Parse `AGENTBOARD_USERS` of the form `alice:secret,bob:` into a
    /// user table. Missing variable means an empty table.
    pub fn from_env() -> Self {
        let mut users = HashMap::new();
        if let Ok(raw) = std::env::var("AGENTBOARD_USERS") {
            for entry in raw.split(',').filter(|s| !s.is_empty()) {
                let (user, password) = entry.split_once(':').unwrap_or((entry, ""));
                users.insert(user.trim().to_string(), password.trim().to_string());
            }
        }
        Self::new(users)
    }

    /// Pre-seed a token (tests and fixed-token deployments).
    pub fn insert_token(&self, token: &str, username: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.to_string(), username.to_string());
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuth {
    async fn authenticate(&self, token: &str) -> Result<String, AuthError> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }

    async fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let expected = self
            .users
            .get(username)
            .ok_or(AuthError::InvalidToken)?;
        if !expected.is_empty() && expected != password {
            return Err(AuthError::InvalidToken);
        }

        let token = new_id();
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(token.clone(), username.to_string());
        Ok(token)
    }
}

/// Pull the bearer token out of the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingToken)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_with(user: &str, password: &str) -> StaticTokenAuth {
        let mut users = HashMap::new();
        users.insert(user.to_string(), password.to_string());
        StaticTokenAuth::new(users)
    }

    #[tokio::test]
    async fn login_then_authenticate() {
        let auth = auth_with("alice", "secret");
        let token = auth.login("alice", "secret").await.unwrap();
        assert_eq!(auth.authenticate(&token).await.unwrap(), "alice");
    }

    #[tokio::test]
    async fn wrong_password_rejected() {
        let auth = auth_with("alice", "secret");
        assert!(auth.login("alice", "nope").await.is_err());
        assert!(auth.login("mallory", "secret").await.is_err());
    }

    #[tokio::test]
    async fn empty_password_accepts_anything() {
        let auth = auth_with("alice", "");
        assert!(auth.login("alice", "whatever").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_token_rejected() {
        let auth = auth_with("alice", "");
        assert!(matches!(
            auth.authenticate("bogus").await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer tok123".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers).unwrap(), "tok123");

        let empty = HeaderMap::new();
        assert!(matches!(bearer_token(&empty), Err(AuthError::MissingToken)));
    }
}

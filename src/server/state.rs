//! Application state shared across handlers.

use std::sync::Arc;

use axum::http::HeaderMap;

use crate::automation::AutomationEngine;
use crate::events::EventBus;
use crate::registry::WorkerRegistry;
use crate::server::auth::{bearer_token, Authenticator};
use crate::server::response::Failure;
use crate::store::Store;
use crate::tasks::TaskService;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<WorkerRegistry>,
    pub tasks: Arc<TaskService>,
    pub automation: Arc<AutomationEngine>,
    pub auth: Arc<dyn Authenticator>,
}

impl AppState {
    /// Resolve the authenticated user from request headers.
    pub async fn require_user(&self, headers: &HeaderMap) -> Result<String, Failure> {
        let token = bearer_token(headers)?;
        Ok(self.auth.authenticate(token).await?)
    }
}

//! Worker registry: registration, heartbeat ingestion, liveness
//! classification, and the worker protocol HTTP handlers.

pub mod routes;
pub mod sweeper;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use tracing::info;

use crate::config::{WorkerDirectives, POLL_MIN_INTERVAL};
use crate::error::{RegistryError, StoreError};
use crate::events::{Event, EventBus};
use crate::store::model::{Worker, WorkerStatus};
use crate::store::Store;

/// Directives returned from a heartbeat.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatDirectives {
    /// Tasks the server cancelled that the worker still reports running.
    pub cancel_task_ids: Vec<String>,
}

pub struct WorkerRegistry {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    directives: WorkerDirectives,
    /// Last poll time per worker, for the 1/s rate limit.
    poll_stamps: Mutex<HashMap<String, Instant>>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>, directives: WorkerDirectives) -> Self {
        Self {
            store,
            bus,
            directives,
            poll_stamps: Mutex::new(HashMap::new()),
        }
    }

    pub fn directives(&self) -> WorkerDirectives {
        self.directives
    }

    /// Register or re-register the user's worker. One worker row per user;
    /// `worker_online` is published only on the transition from a
    /// non-online state.
    pub async fn register(
        &self,
        user_id: &str,
        hostname: &str,
        version: &str,
        capabilities: &[String],
    ) -> Result<Worker, StoreError> {
        let previous = self.store.get_worker_for_user(user_id).await?;
        let worker = self
            .store
            .upsert_worker(
                user_id,
                hostname,
                version,
                capabilities,
                self.directives.max_concurrent_tasks,
            )
            .await?;

        let was_online = previous
            .map(|w| w.status == WorkerStatus::Online)
            .unwrap_or(false);
        if !was_online {
            info!(worker_id = %worker.id, user_id, hostname, "Worker online");
            self.publish_worker_event(&worker, |worker_id, user_id| Event::WorkerOnline {
                worker_id,
                user_id,
            })
            .await?;
        }

        Ok(worker)
    }

    /// Process a heartbeat: bump liveness, hand back cancellation
    /// directives for tasks the worker still thinks are running.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        user_id: &str,
        running_task_ids: &[String],
    ) -> Result<HeartbeatDirectives, RegistryError> {
        let worker = self.owned_worker(worker_id, user_id).await?;

        self.store.touch_heartbeat(worker_id).await?;

        // A stale worker that heartbeats again is back online.
        if worker.status != WorkerStatus::Online {
            info!(worker_id, "Worker recovered");
            self.publish_worker_event(&worker, |worker_id, user_id| Event::WorkerOnline {
                worker_id,
                user_id,
            })
            .await?;
        }

        let cancel_task_ids = self.store.cancelled_among(running_task_ids).await?;
        Ok(HeartbeatDirectives { cancel_task_ids })
    }

    /// Enforce the per-worker poll rate (at most one poll per second).
    pub fn check_poll_rate(&self, worker_id: &str) -> Result<(), RegistryError> {
        let mut stamps = self.poll_stamps.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some(last) = stamps.get(worker_id) {
            if now.duration_since(*last) < POLL_MIN_INTERVAL {
                return Err(RegistryError::RateLimited {
                    worker_id: worker_id.to_string(),
                });
            }
        }
        stamps.insert(worker_id.to_string(), now);
        Ok(())
    }

    /// Fetch a worker and verify ownership.
    pub async fn owned_worker(
        &self,
        worker_id: &str,
        user_id: &str,
    ) -> Result<Worker, RegistryError> {
        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| StoreError::not_found("worker", worker_id))?;
        if worker.user_id != user_id {
            return Err(RegistryError::NotOwner {
                worker_id: worker_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        Ok(worker)
    }

    pub async fn list(&self) -> Result<Vec<Worker>, StoreError> {
        self.store.list_workers().await
    }

    /// Publish a worker lifecycle event to every board the owner belongs
    /// to, plus the owner's user topic.
    pub(crate) async fn publish_worker_event<F>(
        &self,
        worker: &Worker,
        make: F,
    ) -> Result<(), StoreError>
    where
        F: Fn(String, String) -> Event,
    {
        for board_id in self.store.board_ids_for_user(&worker.user_id).await? {
            self.bus
                .publish_to_board(&board_id, make(worker.id.clone(), worker.user_id.clone()));
        }
        self.bus
            .publish_to_user(&worker.user_id, make(worker.id.clone(), worker.user_id.clone()));
        Ok(())
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

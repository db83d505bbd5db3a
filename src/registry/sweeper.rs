//! Stale-worker sweeper.
//!
//! Runs on a fixed tick. Classification is driven purely by heartbeat age:
//! online workers silent past 90 s turn stale; stale ones silent past
//! 300 s turn offline and every task they hold is failed and routed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{OFFLINE_AFTER, OFFLINE_ERROR_SUMMARY, STALE_AFTER};
use crate::error::StoreError;
use crate::events::Event;
use crate::store::model::WorkerStatus;
use crate::tasks::TaskService;

use super::WorkerRegistry;

/// Spawn the sweeper loop. Runs until the handle is aborted.
pub fn spawn(
    registry: Arc<WorkerRegistry>,
    tasks: Arc<TaskService>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_once(&registry, &tasks).await {
                warn!(error = %e, "Worker sweep failed");
            }
        }
    })
}

/// One classification pass with the production thresholds.
pub async fn sweep_once(
    registry: &WorkerRegistry,
    tasks: &TaskService,
) -> Result<(), StoreError> {
    sweep_once_with(registry, tasks, STALE_AFTER, OFFLINE_AFTER).await
}

/// One classification pass. Thresholds are parameters so tests can age
/// workers out in milliseconds instead of minutes.
pub async fn sweep_once_with(
    registry: &WorkerRegistry,
    tasks: &TaskService,
    stale_after: Duration,
    offline_after: Duration,
) -> Result<(), StoreError> {
    let store = registry.store();

    // online ∧ age > stale threshold → stale
    let gone_quiet = store
        .workers_with_heartbeat_older_than(&[WorkerStatus::Online], stale_after.as_millis() as i64)
        .await?;
    for worker in gone_quiet {
        info!(worker_id = %worker.id, "Worker stale");
        store
            .set_worker_status(&worker.id, WorkerStatus::Stale)
            .await?;
        registry
            .publish_worker_event(&worker, |worker_id, user_id| Event::WorkerStale {
                worker_id,
                user_id,
            })
            .await?;
    }

    // stale ∧ age > offline threshold → offline, abandon held tasks
    let gone = store
        .workers_with_heartbeat_older_than(
            &[WorkerStatus::Online, WorkerStatus::Stale],
            offline_after.as_millis() as i64,
        )
        .await?;
    for worker in gone {
        info!(worker_id = %worker.id, "Worker offline");
        store
            .set_worker_status(&worker.id, WorkerStatus::Offline)
            .await?;
        registry
            .publish_worker_event(&worker, |worker_id, user_id| Event::WorkerOffline {
                worker_id,
                user_id,
            })
            .await?;

        for task in store.tasks_held_by_worker(&worker.id).await? {
            if let Err(e) = tasks.force_fail(&task.id, OFFLINE_ERROR_SUMMARY).await {
                warn!(task_id = %task.id, error = %e, "Failed to abandon task of offline worker");
            }
        }
    }

    Ok(())
}

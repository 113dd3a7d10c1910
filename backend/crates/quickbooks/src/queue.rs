use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use opsdesk_db::entities::models::EntityType;
use opsdesk_db::tokens::repositories::TokenRepository;

use crate::sync::SyncCoordinator;
use crate::tokens::MIN_TICK;

/// A request to sync one entity type, or every type when `entity_type` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncJob {
    pub realm_id: String,
    pub entity_type: Option<EntityType>,
}

impl SyncJob {
    pub fn entity(realm_id: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            realm_id: realm_id.into(),
            entity_type: Some(entity_type),
        }
    }

    pub fn all(realm_id: impl Into<String>) -> Self {
        Self {
            realm_id: realm_id.into(),
            entity_type: None,
        }
    }
}

type Pending = Arc<Mutex<HashSet<SyncJob>>>;

/// Producer side of the background sync queue. Jobs identical to one that is
/// still waiting are dropped.
#[derive(Clone)]
pub struct SyncQueue {
    tx: mpsc::UnboundedSender<SyncJob>,
    pending: Pending,
}

pub struct SyncQueueReceiver {
    rx: mpsc::UnboundedReceiver<SyncJob>,
    pending: Pending,
}

impl SyncQueue {
    pub fn new() -> (Self, SyncQueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::default();
        (
            Self {
                tx,
                pending: pending.clone(),
            },
            SyncQueueReceiver { rx, pending },
        )
    }

    /// Returns `true` if the job was queued, `false` if an identical job is
    /// already waiting or the worker has gone away.
    pub fn enqueue(&self, job: SyncJob) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if pending.contains(&job) {
            tracing::debug!(?job, "sync job already pending");
            return false;
        }
        if self.tx.send(job.clone()).is_err() {
            tracing::warn!(?job, "sync worker stopped, dropping job");
            return false;
        }
        pending.insert(job);
        true
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl SyncQueueReceiver {
    /// Next job; once taken, an identical job may be queued again.
    pub async fn next(&mut self) -> Option<SyncJob> {
        let job = self.rx.recv().await?;
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&job);
        Some(job)
    }
}

/// Drain the queue one job at a time until cancelled.
pub fn spawn_sync_worker(
    coordinator: Arc<SyncCoordinator>,
    mut receiver: SyncQueueReceiver,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("sync worker started");
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = receiver.next() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            run_job(&coordinator, job, &cancel).await;
        }
        tracing::info!("sync worker stopped");
    })
}

async fn run_job(coordinator: &SyncCoordinator, job: SyncJob, cancel: &CancellationToken) {
    match job.entity_type {
        Some(entity_type) => {
            if let Err(e) = coordinator
                .sync_entity(&job.realm_id, entity_type, cancel)
                .await
            {
                tracing::warn!(realm_id = %job.realm_id, %entity_type, error = %e, "queued sync failed");
            }
        }
        None => {
            coordinator.sync_all(&job.realm_id, cancel).await;
        }
    }
}

/// Queue a full sync for every connected realm every `interval`.
pub fn spawn_periodic_sync(
    tokens: Arc<dyn TokenRepository>,
    queue: SyncQueue,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // `interval` panics on a zero period.
        let interval = interval.max(MIN_TICK);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_secs = interval.as_secs(), "periodic sync started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match tokens.list_active_realms().await {
                        Ok(realms) => {
                            for realm_id in realms {
                                queue.enqueue(SyncJob::all(realm_id));
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "failed to list connected realms"),
                    }
                }
            }
        }
    })
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::sync::models::SyncState;
use opsdesk_common::error::OpsResult;

#[async_trait]
pub trait SyncStateRepository: Send + Sync {
    /// Get or create the state row for a realm+entity pair.
    async fn get_or_create(&self, realm_id: &str, entity_type: &str) -> OpsResult<SyncState>;

    /// Atomically set status to 'running' only if currently 'idle' or 'failed'.
    /// Returns `None` if already running (lock not acquired).
    async fn acquire_lock(&self, realm_id: &str, entity_type: &str)
        -> OpsResult<Option<SyncState>>;

    /// Mark a pass as completed and advance the watermark.
    /// A `None` watermark keeps the previous value.
    async fn mark_completed(
        &self,
        id: Uuid,
        watermark: Option<DateTime<Utc>>,
    ) -> OpsResult<SyncState>;

    /// Mark a pass as failed with an error message. The watermark is untouched.
    async fn mark_failed(&self, id: Uuid, error_message: &str) -> OpsResult<SyncState>;

    /// Bump `updated_at` on a running pass so it is not mistaken for stale.
    async fn heartbeat(&self, id: Uuid) -> OpsResult<()>;

    async fn list_for_realm(&self, realm_id: &str) -> OpsResult<Vec<SyncState>>;

    /// Flip rows stuck in 'running' since before `stale_before` (left by a
    /// crashed process) to 'failed'.
    async fn reset_stale_locks(&self, stale_before: DateTime<Utc>) -> OpsResult<u64>;
}

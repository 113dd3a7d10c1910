use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::sync::models::{SyncState, SyncStatus};
use crate::sync::repositories::SyncStateRepository;
use opsdesk_common::error::{OpsError, OpsResult};

const STATE_COLUMNS: &str = "id, realm_id, entity_type, last_synced_at, watermark, status, \
     error_message, created_at, updated_at";

#[derive(Clone)]
pub struct PgSyncStateRepository {
    pool: PgPool,
}

impl PgSyncStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: sqlx::postgres::PgRow) -> OpsResult<SyncState> {
        let status_raw: String = row.get("status");
        let status = SyncStatus::from_str(&status_raw).map_err(OpsError::Internal)?;

        Ok(SyncState {
            id: row.get("id"),
            realm_id: row.get("realm_id"),
            entity_type: row.get("entity_type"),
            last_synced_at: row.get("last_synced_at"),
            watermark: row.get("watermark"),
            status,
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl SyncStateRepository for PgSyncStateRepository {
    async fn get_or_create(&self, realm_id: &str, entity_type: &str) -> OpsResult<SyncState> {
        let row = sqlx::query(&format!(
            "insert into qbo_sync_states (id, realm_id, entity_type)
             values ($1, $2, $3)
             on conflict (realm_id, entity_type) do update set updated_at = qbo_sync_states.updated_at
             returning {STATE_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(realm_id)
        .bind(entity_type)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn acquire_lock(
        &self,
        realm_id: &str,
        entity_type: &str,
    ) -> OpsResult<Option<SyncState>> {
        let row = sqlx::query(&format!(
            "update qbo_sync_states
             set status = 'running', error_message = null, updated_at = $1
             where realm_id = $2 and entity_type = $3 and status != 'running'
             returning {STATE_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(realm_id)
        .bind(entity_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        row.map(Self::map_row).transpose()
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        watermark: Option<DateTime<Utc>>,
    ) -> OpsResult<SyncState> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "update qbo_sync_states
             set status = 'idle', last_synced_at = $1,
                 watermark = coalesce($2, watermark),
                 error_message = null, updated_at = $1
             where id = $3
             returning {STATE_COLUMNS}"
        ))
        .bind(now)
        .bind(watermark)
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> OpsResult<SyncState> {
        let row = sqlx::query(&format!(
            "update qbo_sync_states
             set status = 'failed', error_message = $1, updated_at = $2
             where id = $3
             returning {STATE_COLUMNS}"
        ))
        .bind(error_message)
        .bind(Utc::now())
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn heartbeat(&self, id: Uuid) -> OpsResult<()> {
        sqlx::query(
            "update qbo_sync_states set updated_at = $1
             where id = $2 and status = 'running'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_for_realm(&self, realm_id: &str) -> OpsResult<Vec<SyncState>> {
        let rows = sqlx::query(&format!(
            "select {STATE_COLUMNS} from qbo_sync_states
             where realm_id = $1 order by entity_type"
        ))
        .bind(realm_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        rows.into_iter().map(Self::map_row).collect()
    }

    async fn reset_stale_locks(&self, stale_before: DateTime<Utc>) -> OpsResult<u64> {
        let result = sqlx::query(
            "update qbo_sync_states
             set status = 'failed', error_message = 'interrupted before completion', updated_at = $1
             where status = 'running' and updated_at < $2",
        )
        .bind(Utc::now())
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

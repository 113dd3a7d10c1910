use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::map_write_error;
use crate::tokens::models::{NewToken, QboToken};
use crate::tokens::repositories::TokenRepository;
use opsdesk_common::error::{OpsError, OpsResult};

const TOKEN_COLUMNS: &str = "id, realm_id, access_token, refresh_token, expires_at, \
     refresh_token_expires_at, is_active, created_at, last_updated";

#[derive(Clone)]
pub struct PgTokenRepository {
    pool: PgPool,
}

impl PgTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: PgRow) -> QboToken {
        QboToken {
            id: row.get("id"),
            realm_id: row.get("realm_id"),
            access_token: row.get("access_token"),
            refresh_token: row.get("refresh_token"),
            expires_at: row.get("expires_at"),
            refresh_token_expires_at: row.get("refresh_token_expires_at"),
            is_active: row.get("is_active"),
            created_at: row.get("created_at"),
            last_updated: row.get("last_updated"),
        }
    }
}

#[async_trait]
impl TokenRepository for PgTokenRepository {
    async fn get_active(&self, realm_id: &str) -> OpsResult<Option<QboToken>> {
        let row = sqlx::query(&format!(
            "select {TOKEN_COLUMNS} from qbo_tokens where realm_id = $1 and is_active"
        ))
        .bind(realm_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        Ok(row.map(Self::map_row))
    }

    async fn rotate(&self, token: NewToken) -> OpsResult<QboToken> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| OpsError::Database(e.to_string()))?;
        let now = Utc::now();

        let retired = sqlx::query(
            "update qbo_tokens set is_active = false, last_updated = $1
             where realm_id = $2 and is_active",
        )
        .bind(now)
        .bind(&token.realm_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        let row = sqlx::query(&format!(
            "insert into qbo_tokens
             (id, realm_id, access_token, refresh_token, expires_at, refresh_token_expires_at,
              is_active, created_at, last_updated)
             values ($1, $2, $3, $4, $5, $6, true, $7, $7)
             returning {TOKEN_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&token.realm_id)
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(token.expires_at)
        .bind(token.refresh_token_expires_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_write_error(e, "another token rotation won the race for this realm"))?;

        tx.commit()
            .await
            .map_err(|e| OpsError::Database(e.to_string()))?;

        tracing::debug!(
            realm_id = %token.realm_id,
            retired = retired.rows_affected(),
            "token rotated"
        );
        Ok(Self::map_row(row))
    }

    async fn deactivate_all(&self, realm_id: &str) -> OpsResult<u64> {
        let result = sqlx::query(
            "update qbo_tokens set is_active = false, last_updated = $1
             where realm_id = $2 and is_active",
        )
        .bind(Utc::now())
        .bind(realm_id)
        .execute(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn list_expiring(&self, before: DateTime<Utc>) -> OpsResult<Vec<QboToken>> {
        let rows = sqlx::query(&format!(
            "select {TOKEN_COLUMNS} from qbo_tokens
             where is_active and expires_at < $1
             order by expires_at"
        ))
        .bind(before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(Self::map_row).collect())
    }

    async fn list_active_realms(&self) -> OpsResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "select realm_id from qbo_tokens where is_active order by realm_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))
    }
}

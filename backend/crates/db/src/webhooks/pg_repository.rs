use async_trait::async_trait;
use sqlx::PgPool;

use crate::webhooks::models::WebhookEvent;
use crate::webhooks::repositories::WebhookEventRepository;
use opsdesk_common::error::{OpsError, OpsResult};

#[derive(Clone)]
pub struct PgWebhookEventRepository {
    pool: PgPool,
}

impl PgWebhookEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEventRepository for PgWebhookEventRepository {
    async fn record(&self, event: &WebhookEvent) -> OpsResult<bool> {
        let result = sqlx::query(
            "insert into webhook_events
             (id, provider, dedup_key, realm_id, entity_type, external_id, operation, received_at)
             values ($1, $2, $3, $4, $5, $6, $7, $8)
             on conflict (provider, dedup_key) do nothing",
        )
        .bind(event.id)
        .bind(&event.provider)
        .bind(&event.dedup_key)
        .bind(&event.realm_id)
        .bind(&event.entity_type)
        .bind(&event.external_id)
        .bind(&event.operation)
        .bind(event.received_at)
        .execute(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;
    use chrono::Utc;
    use uuid::Uuid;

    fn event(key: &str) -> WebhookEvent {
        WebhookEvent {
            id: Uuid::new_v4(),
            provider: "quickbooks".to_string(),
            dedup_key: key.to_string(),
            realm_id: "123".to_string(),
            entity_type: "customer".to_string(),
            external_id: Some("1".to_string()),
            operation: Some("Update".to_string()),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn redelivery_is_not_recorded_twice() {
        let pool = match test_pool().await {
            Some(p) => p,
            None => return,
        };
        let repo = PgWebhookEventRepository::new(pool);
        let key = format!("key-{}", Uuid::new_v4());

        assert!(repo.record(&event(&key)).await.expect("first"));
        assert!(!repo.record(&event(&key)).await.expect("redelivery"));
    }
}

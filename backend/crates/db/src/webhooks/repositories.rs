use async_trait::async_trait;

use crate::webhooks::models::WebhookEvent;
use opsdesk_common::error::OpsResult;

#[async_trait]
pub trait WebhookEventRepository: Send + Sync {
    /// Record a notification. Returns `false` if `(provider, dedup_key)` was
    /// already recorded.
    async fn record(&self, event: &WebhookEvent) -> OpsResult<bool>;
}

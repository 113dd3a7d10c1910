use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One received change notification. `dedup_key` is unique per provider so a
/// redelivered notification is recorded only once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub provider: String,
    pub dedup_key: String,
    pub realm_id: String,
    pub entity_type: String,
    pub external_id: Option<String>,
    pub operation: Option<String>,
    pub received_at: DateTime<Utc>,
}

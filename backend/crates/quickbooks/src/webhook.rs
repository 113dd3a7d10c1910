//! Inbound change notifications.
//!
//! Two delivery formats are understood: Intuit's own `eventNotifications`
//! payload, signed with the app's verifier token, and row-change events from
//! a database webhook, authenticated with a shared secret. Both are reduced to
//! [`ChangeNotification`]s that are recorded for dedup and turned into
//! [`SyncJob`]s for the background worker.

use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use ring::{digest, hmac};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use opsdesk_db::entities::models::EntityType;
use opsdesk_db::webhooks::models::WebhookEvent;
use opsdesk_db::webhooks::repositories::WebhookEventRepository;

use crate::queue::{SyncJob, SyncQueue};

pub const INTUIT_SIGNATURE_HEADER: &str = "intuit-signature";
pub const SHARED_SECRET_HEADER: &str = "x-webhook-secret";

/// `base64(HMAC-SHA256(verifier_token, body))`, the value Intuit sends in
/// `intuit-signature`.
pub fn sign_intuit_payload(verifier_token: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, verifier_token.as_bytes());
    BASE64.encode(hmac::sign(&key, body).as_ref())
}

pub fn verify_intuit_signature(verifier_token: &str, body: &[u8], signature: &str) -> bool {
    let Ok(tag) = BASE64.decode(signature.trim()) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, verifier_token.as_bytes());
    hmac::verify(&key, body, &tag).is_ok()
}

/// Constant-time comparison of a presented secret against the configured one.
pub fn verify_shared_secret(expected: &str, provided: &str) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, expected.as_bytes());
    let tag = hmac::sign(&key, expected.as_bytes());
    hmac::verify(&key, provided.as_bytes(), tag.as_ref()).is_ok()
}

/// One upstream change that should trigger a sync.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub realm_id: String,
    pub entity_type: EntityType,
    pub external_id: Option<String>,
    pub operation: Option<String>,
    /// Stable identity of the delivery; redeliveries produce the same key.
    pub dedup_key: String,
}

// ── Intuit payload ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntuitPayload {
    #[serde(default)]
    pub event_notifications: Vec<EventNotification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNotification {
    pub realm_id: String,
    pub data_change_event: Option<DataChangeEvent>,
}

#[derive(Debug, Deserialize)]
pub struct DataChangeEvent {
    #[serde(default)]
    pub entities: Vec<ChangedEntity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedEntity {
    pub name: String,
    pub id: String,
    pub operation: Option<String>,
    pub last_updated: Option<String>,
}

impl IntuitPayload {
    /// Notifications for mirrored entity types; other types are dropped.
    pub fn notifications(&self) -> Vec<ChangeNotification> {
        let mut out = Vec::new();
        for notification in &self.event_notifications {
            let Some(change) = &notification.data_change_event else {
                continue;
            };
            for entity in &change.entities {
                let Ok(entity_type) = entity.name.parse::<EntityType>() else {
                    tracing::debug!(name = %entity.name, "ignoring unmirrored entity type");
                    continue;
                };
                out.push(ChangeNotification {
                    realm_id: notification.realm_id.clone(),
                    entity_type,
                    external_id: Some(entity.id.clone()),
                    operation: entity.operation.clone(),
                    dedup_key: format!(
                        "{}:{}:{}:{}:{}",
                        notification.realm_id,
                        entity_type,
                        entity.id,
                        entity.operation.as_deref().unwrap_or(""),
                        entity.last_updated.as_deref().unwrap_or("")
                    ),
                });
            }
        }
        out
    }
}

// ── Database row-change payload ─────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RowChangePayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub table: String,
    pub schema: Option<String>,
    pub record: Option<Value>,
    pub old_record: Option<Value>,
}

impl RowChangePayload {
    /// The notification for `realm_id`, or `None` if the table is not a
    /// mirrored entity type.
    pub fn notification(&self, realm_id: &str) -> Option<ChangeNotification> {
        let entity_type = self.table.parse::<EntityType>().ok()?;

        let row = self
            .record
            .as_ref()
            .filter(|r| !r.is_null())
            .or(self.old_record.as_ref());
        let external_id = row.and_then(|r| r.get("id")).and_then(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        let fingerprint = row
            .and_then(|r| serde_json::to_vec(r).ok())
            .map(|bytes| URL_SAFE_NO_PAD.encode(digest::digest(&digest::SHA256, &bytes)))
            .unwrap_or_default();

        Some(ChangeNotification {
            realm_id: realm_id.to_string(),
            entity_type,
            dedup_key: format!(
                "{}:{}:{}:{}:{}",
                realm_id,
                entity_type,
                external_id.as_deref().unwrap_or(""),
                self.kind.to_ascii_uppercase(),
                fingerprint
            ),
            external_id,
            operation: Some(self.kind.to_ascii_uppercase()),
        })
    }
}

// ── Processing ──────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WebhookOutcome {
    pub received: usize,
    pub duplicates: usize,
    pub enqueued: usize,
}

/// Records notifications and queues the resulting syncs. Never runs a sync
/// itself.
#[derive(Clone)]
pub struct WebhookProcessor {
    events: Arc<dyn WebhookEventRepository>,
    queue: SyncQueue,
}

impl WebhookProcessor {
    pub fn new(events: Arc<dyn WebhookEventRepository>, queue: SyncQueue) -> Self {
        Self { events, queue }
    }

    pub async fn process(
        &self,
        provider: &str,
        notifications: Vec<ChangeNotification>,
    ) -> WebhookOutcome {
        let mut outcome = WebhookOutcome {
            received: notifications.len(),
            ..WebhookOutcome::default()
        };

        for n in notifications {
            let event = WebhookEvent {
                id: Uuid::new_v4(),
                provider: provider.to_string(),
                dedup_key: n.dedup_key.clone(),
                realm_id: n.realm_id.clone(),
                entity_type: n.entity_type.as_str().to_string(),
                external_id: n.external_id.clone(),
                operation: n.operation.clone(),
                received_at: Utc::now(),
            };

            match self.events.record(&event).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(provider, dedup_key = %n.dedup_key, "duplicate webhook delivery");
                    outcome.duplicates += 1;
                    continue;
                }
                // Losing the dedup record only risks an extra sync.
                Err(e) => tracing::warn!(provider, error = %e, "failed to record webhook event"),
            }

            if self.queue.enqueue(SyncJob::entity(n.realm_id, n.entity_type)) {
                outcome.enqueued += 1;
            }
        }

        tracing::info!(
            provider,
            received = outcome.received,
            duplicates = outcome.duplicates,
            enqueued = outcome.enqueued,
            "webhook processed"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsdesk_db::memory::InMemoryWebhookEventRepository;
    use serde_json::json;

    fn intuit_body() -> Value {
        json!({
            "eventNotifications": [{
                "realmId": "1185883450",
                "dataChangeEvent": {
                    "entities": [
                        {"name": "Customer", "id": "1", "operation": "Update", "lastUpdated": "2024-02-01T18:43:42.000Z"},
                        {"name": "Invoice", "id": "130", "operation": "Create", "lastUpdated": "2024-02-01T18:44:00.000Z"},
                        {"name": "Vendor", "id": "9", "operation": "Update", "lastUpdated": "2024-02-01T18:45:00.000Z"}
                    ]
                }
            }]
        })
    }

    #[test]
    fn intuit_signature_round_trip() {
        let body = br#"{"eventNotifications":[]}"#;
        let signature = sign_intuit_payload("verifier", body);
        assert!(verify_intuit_signature("verifier", body, &signature));
        assert!(!verify_intuit_signature("other", body, &signature));
        assert!(!verify_intuit_signature("verifier", b"tampered", &signature));
        assert!(!verify_intuit_signature("verifier", body, "not base64!"));
    }

    #[test]
    fn shared_secret_comparison() {
        assert!(verify_shared_secret("s3cret", "s3cret"));
        assert!(!verify_shared_secret("s3cret", "s3cret "));
        assert!(!verify_shared_secret("s3cret", ""));
    }

    #[test]
    fn intuit_payload_keeps_mirrored_types() {
        let payload: IntuitPayload = serde_json::from_value(intuit_body()).unwrap();
        let notifications = payload.notifications();

        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].entity_type, EntityType::Customer);
        assert_eq!(notifications[0].realm_id, "1185883450");
        assert_eq!(notifications[1].external_id.as_deref(), Some("130"));
        assert_ne!(notifications[0].dedup_key, notifications[1].dedup_key);
    }

    #[test]
    fn row_change_maps_table_to_entity() {
        let payload: RowChangePayload = serde_json::from_value(json!({
            "type": "UPDATE",
            "table": "Customer",
            "record": {"id": "1"},
            "schema": "public",
            "old_record": null
        }))
        .unwrap();

        let n = payload.notification("123").unwrap();
        assert_eq!(n.realm_id, "123");
        assert_eq!(n.entity_type, EntityType::Customer);
        assert_eq!(n.external_id.as_deref(), Some("1"));
        assert_eq!(n.operation.as_deref(), Some("UPDATE"));
    }

    #[test]
    fn row_delete_uses_old_record_id() {
        let payload: RowChangePayload = serde_json::from_value(json!({
            "type": "DELETE",
            "table": "invoices",
            "record": null,
            "old_record": {"id": 77}
        }))
        .unwrap();

        let n = payload.notification("123").unwrap();
        assert_eq!(n.entity_type, EntityType::Invoice);
        assert_eq!(n.external_id.as_deref(), Some("77"));
    }

    #[test]
    fn row_change_for_unknown_table_ignored() {
        let payload: RowChangePayload = serde_json::from_value(json!({
            "type": "INSERT",
            "table": "audit_log",
            "record": {"id": 1}
        }))
        .unwrap();
        assert!(payload.notification("123").is_none());
    }

    #[tokio::test]
    async fn redelivery_is_recorded_once() {
        let events = Arc::new(InMemoryWebhookEventRepository::new());
        let (queue, mut rx) = SyncQueue::new();
        let processor = WebhookProcessor::new(events.clone(), queue);
        let payload: IntuitPayload = serde_json::from_value(intuit_body()).unwrap();

        let first = processor
            .process("quickbooks", payload.notifications())
            .await;
        assert_eq!(first.enqueued, 2);

        let second = processor
            .process("quickbooks", payload.notifications())
            .await;
        assert_eq!(second.duplicates, 2);
        assert_eq!(second.enqueued, 0);
        assert_eq!(events.recorded().len(), 2);

        assert_eq!(
            rx.next().await,
            Some(SyncJob::entity("1185883450", EntityType::Customer))
        );
    }
}

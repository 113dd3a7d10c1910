use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    pub authorization_url: String,
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectionResponse {
    pub realm_id: String,
    pub connected: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Set when the connection was verified against the company endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncQueuedResponse {
    pub realm_id: String,
    /// `None` means every entity type.
    pub entity_type: Option<String>,
    /// False when an identical job was already waiting.
    pub queued: bool,
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::tokens::models::{NewToken, QboToken};
use opsdesk_common::error::OpsResult;

#[async_trait]
pub trait TokenRepository: Send + Sync {
    /// The single active token for a realm, if any.
    async fn get_active(&self, realm_id: &str) -> OpsResult<Option<QboToken>>;

    /// Insert `token` as the active row and deactivate every other row for the realm.
    /// Both writes happen atomically.
    async fn rotate(&self, token: NewToken) -> OpsResult<QboToken>;

    /// Soft-retire all rows for a realm. Returns the number of rows deactivated.
    async fn deactivate_all(&self, realm_id: &str) -> OpsResult<u64>;

    /// Active tokens whose access token expires before `before`.
    async fn list_expiring(&self, before: DateTime<Utc>) -> OpsResult<Vec<QboToken>>;

    /// Realms that currently hold an active token.
    async fn list_active_realms(&self) -> OpsResult<Vec<String>>;
}

use async_trait::async_trait;

use crate::entities::models::{EntityFilter, EntityType, MirroredEntity};
use opsdesk_common::error::OpsResult;

#[async_trait]
pub trait EntityRepository: Send + Sync {
    /// Insert or update keyed by (realm_id, entity_type, external_id).
    /// Rows whose payload and sync token are unchanged are left untouched.
    async fn upsert(&self, entity: &MirroredEntity) -> OpsResult<()>;

    async fn get(
        &self,
        realm_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> OpsResult<Option<MirroredEntity>>;

    /// Page of entities plus the total row count for the filter.
    async fn list(
        &self,
        realm_id: &str,
        entity_type: EntityType,
        filter: EntityFilter,
    ) -> OpsResult<(Vec<MirroredEntity>, i64)>;
}

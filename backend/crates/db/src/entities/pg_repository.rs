use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, QueryBuilder, Row};

use crate::entities::models::{EntityFilter, EntityType, MirroredEntity};
use crate::entities::repositories::EntityRepository;
use opsdesk_common::error::{OpsError, OpsResult};

const ENTITY_COLUMNS: &str = "id, realm_id, entity_type, external_id, sync_token, display_name, \
     total_amount, remote_updated_at, payload, synced_at";

#[derive(Clone)]
pub struct PgEntityRepository {
    pool: PgPool,
}

impl PgEntityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: PgRow) -> OpsResult<MirroredEntity> {
        let type_raw: String = row.get("entity_type");
        let entity_type = EntityType::from_str(&type_raw).map_err(OpsError::Internal)?;

        Ok(MirroredEntity {
            id: row.get("id"),
            realm_id: row.get("realm_id"),
            entity_type,
            external_id: row.get("external_id"),
            sync_token: row.get("sync_token"),
            display_name: row.get("display_name"),
            total_amount: row.get("total_amount"),
            remote_updated_at: row.get("remote_updated_at"),
            payload: row.get("payload"),
            synced_at: row.get("synced_at"),
        })
    }

    fn push_filter<'a>(
        qb: &mut QueryBuilder<'a, sqlx::Postgres>,
        realm_id: &'a str,
        entity_type: EntityType,
        filter: &'a EntityFilter,
    ) {
        qb.push(" where realm_id = ").push_bind(realm_id);
        qb.push(" and entity_type = ").push_bind(entity_type.as_str());
        if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            qb.push(" and display_name ilike ")
                .push_bind(format!("%{}%", search.trim()));
        }
    }
}

#[async_trait]
impl EntityRepository for PgEntityRepository {
    async fn upsert(&self, entity: &MirroredEntity) -> OpsResult<()> {
        sqlx::query(
            "insert into qbo_entities
             (id, realm_id, entity_type, external_id, sync_token, display_name,
              total_amount, remote_updated_at, payload, synced_at)
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             on conflict (realm_id, entity_type, external_id) do update set
               sync_token = excluded.sync_token,
               display_name = excluded.display_name,
               total_amount = excluded.total_amount,
               remote_updated_at = excluded.remote_updated_at,
               payload = excluded.payload,
               synced_at = excluded.synced_at
             where qbo_entities.payload is distinct from excluded.payload
                or qbo_entities.sync_token is distinct from excluded.sync_token",
        )
        .bind(entity.id)
        .bind(&entity.realm_id)
        .bind(entity.entity_type.as_str())
        .bind(&entity.external_id)
        .bind(&entity.sync_token)
        .bind(&entity.display_name)
        .bind(entity.total_amount)
        .bind(entity.remote_updated_at)
        .bind(&entity.payload)
        .bind(entity.synced_at)
        .execute(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get(
        &self,
        realm_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> OpsResult<Option<MirroredEntity>> {
        let row = sqlx::query(&format!(
            "select {ENTITY_COLUMNS} from qbo_entities
             where realm_id = $1 and entity_type = $2 and external_id = $3"
        ))
        .bind(realm_id)
        .bind(entity_type.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        row.map(Self::map_row).transpose()
    }

    async fn list(
        &self,
        realm_id: &str,
        entity_type: EntityType,
        filter: EntityFilter,
    ) -> OpsResult<(Vec<MirroredEntity>, i64)> {
        let mut count_qb = QueryBuilder::new("select count(*) from qbo_entities");
        Self::push_filter(&mut count_qb, realm_id, entity_type, &filter);
        let total: i64 = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| OpsError::Database(e.to_string()))?;

        let mut qb = QueryBuilder::new(format!("select {ENTITY_COLUMNS} from qbo_entities"));
        Self::push_filter(&mut qb, realm_id, entity_type, &filter);
        qb.push(" order by display_name nulls last, external_id");
        qb.push(" limit ").push_bind(filter.limit.unwrap_or(50));
        qb.push(" offset ").push_bind(filter.offset.unwrap_or(0));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OpsError::Database(e.to_string()))?;

        let data = rows
            .into_iter()
            .map(Self::map_row)
            .collect::<OpsResult<Vec<_>>>()?;
        Ok((data, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;
    use chrono::Utc;
    use uuid::Uuid;

    fn customer(realm: &str, external_id: &str, name: &str) -> MirroredEntity {
        MirroredEntity {
            id: Uuid::new_v4(),
            realm_id: realm.to_string(),
            entity_type: EntityType::Customer,
            external_id: external_id.to_string(),
            sync_token: Some("0".to_string()),
            display_name: Some(name.to_string()),
            total_amount: None,
            remote_updated_at: Some(Utc::now()),
            payload: serde_json::json!({ "Id": external_id, "DisplayName": name }),
            synced_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_external_id() {
        let pool = match test_pool().await {
            Some(p) => p,
            None => return,
        };
        let repo = PgEntityRepository::new(pool);
        let realm = format!("realm-{}", Uuid::new_v4());

        let record = customer(&realm, "1", "Amy's Bird Sanctuary");
        repo.upsert(&record).await.expect("first upsert");
        // Same upstream record, new local id: must not duplicate.
        repo.upsert(&customer(&realm, "1", "Amy's Bird Sanctuary"))
            .await
            .expect("second upsert");

        let (rows, total) = repo
            .list(&realm, EntityType::Customer, EntityFilter::default())
            .await
            .expect("list");
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, record.id);
    }

    #[tokio::test]
    async fn upsert_updates_changed_payload() {
        let pool = match test_pool().await {
            Some(p) => p,
            None => return,
        };
        let repo = PgEntityRepository::new(pool);
        let realm = format!("realm-{}", Uuid::new_v4());

        repo.upsert(&customer(&realm, "7", "Old Name")).await.expect("insert");
        let mut changed = customer(&realm, "7", "New Name");
        changed.sync_token = Some("1".to_string());
        repo.upsert(&changed).await.expect("update");

        let stored = repo
            .get(&realm, EntityType::Customer, "7")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.display_name.as_deref(), Some("New Name"));
        assert_eq!(stored.sync_token.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn list_filters_by_search_and_paginates() {
        let pool = match test_pool().await {
            Some(p) => p,
            None => return,
        };
        let repo = PgEntityRepository::new(pool);
        let realm = format!("realm-{}", Uuid::new_v4());

        for (id, name) in [("1", "Alpha Plumbing"), ("2", "Beta Roofing"), ("3", "Alpha Electric")] {
            repo.upsert(&customer(&realm, id, name)).await.expect("upsert");
        }

        let filter = EntityFilter {
            search: Some("alpha".to_string()),
            limit: Some(1),
            offset: Some(0),
        };
        let (rows, total) = repo
            .list(&realm, EntityType::Customer, filter)
            .await
            .expect("list");
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].display_name.as_deref(), Some("Alpha Electric"));
    }
}

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use opsdesk_db::entities::models::EntityType;
use opsdesk_db::entities::repositories::EntityRepository;
use opsdesk_db::sync::repositories::SyncStateRepository;

use crate::client::EntitySource;
use crate::error::QboError;
use crate::models::to_mirrored;

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub realm_id: String,
    pub entity_type: EntityType,
    pub fetched: usize,
    pub upserted: usize,
    pub errors: usize,
    pub pages: usize,
    /// True when another pass already held the lock and nothing ran.
    pub skipped: bool,
    pub watermark: Option<DateTime<Utc>>,
}

impl SyncResult {
    fn skipped(realm_id: &str, entity_type: EntityType) -> Self {
        Self {
            realm_id: realm_id.to_string(),
            entity_type,
            fetched: 0,
            upserted: 0,
            errors: 0,
            pages: 0,
            skipped: true,
            watermark: None,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct SyncAllReport {
    pub completed: Vec<SyncResult>,
    pub failed: Vec<(EntityType, String)>,
}

#[derive(Default)]
struct PassOutcome {
    fetched: usize,
    upserted: usize,
    errors: usize,
    pages: usize,
    max_seen: Option<DateTime<Utc>>,
}

/// A running lock whose pass has not touched it for this long is presumed
/// orphaned. Passes heartbeat after every page, and one page is bounded by
/// the HTTP timeout and a token refresh.
pub const STALE_LOCK_AFTER_SECS: i64 = 30 * 60;

/// Fail `running` locks that have not been touched within
/// [`STALE_LOCK_AFTER_SECS`] of `now`. Live passes in another process keep
/// their locks.
pub async fn release_stale_locks(
    states: &dyn SyncStateRepository,
    now: DateTime<Utc>,
) -> Result<u64, QboError> {
    let cutoff = now - chrono::Duration::seconds(STALE_LOCK_AFTER_SECS);
    let released = states.reset_stale_locks(cutoff).await?;
    if released > 0 {
        tracing::warn!(released, %cutoff, "released stale sync locks");
    }
    Ok(released)
}

/// The query filter is second-granular.
fn whole_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}

/// Incremental pull of QuickBooks collections into the local mirror.
///
/// A pass holds the (realm, entity) lock for its whole duration and only
/// advances the watermark after every page has been applied, so an
/// interrupted pass is replayed from the previous watermark next time.
pub struct SyncCoordinator {
    source: Arc<dyn EntitySource>,
    states: Arc<dyn SyncStateRepository>,
    entities: Arc<dyn EntityRepository>,
}

impl SyncCoordinator {
    pub fn new(
        source: Arc<dyn EntitySource>,
        states: Arc<dyn SyncStateRepository>,
        entities: Arc<dyn EntityRepository>,
    ) -> Self {
        Self {
            source,
            states,
            entities,
        }
    }

    pub async fn sync_entity(
        &self,
        realm_id: &str,
        entity_type: EntityType,
        cancel: &CancellationToken,
    ) -> Result<SyncResult, QboError> {
        self.states
            .get_or_create(realm_id, entity_type.as_str())
            .await?;

        let state = match self
            .states
            .acquire_lock(realm_id, entity_type.as_str())
            .await?
        {
            Some(state) => state,
            None => {
                tracing::info!(realm_id, %entity_type, "sync already running, skipping");
                return Ok(SyncResult::skipped(realm_id, entity_type));
            }
        };

        let outcome = match self
            .run_pass(realm_id, entity_type, state.id, state.watermark, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let msg = e.to_string();
                tracing::error!(realm_id, %entity_type, error = %msg, "sync pass failed");
                if let Err(mark_err) = self.states.mark_failed(state.id, &msg).await {
                    tracing::error!(realm_id, %entity_type, error = %mark_err, "could not release sync lock");
                }
                return Err(e);
            }
        };

        // Records that failed to apply must be fetched again, so the
        // watermark only moves when the whole pass landed.
        let advance_to = if outcome.errors == 0 {
            match (state.watermark, outcome.max_seen) {
                (Some(old), Some(seen)) => Some(old.max(seen)),
                (None, seen) => seen,
                (old, None) => old,
            }
        } else {
            tracing::warn!(
                realm_id,
                %entity_type,
                errors = outcome.errors,
                "holding watermark because some records were not applied"
            );
            None
        };

        let completed = self.states.mark_completed(state.id, advance_to).await?;

        let result = SyncResult {
            realm_id: realm_id.to_string(),
            entity_type,
            fetched: outcome.fetched,
            upserted: outcome.upserted,
            errors: outcome.errors,
            pages: outcome.pages,
            skipped: false,
            watermark: completed.watermark,
        };
        tracing::info!(?result, "sync pass completed");
        Ok(result)
    }

    /// Keyset pagination over `LastUpdatedTime`.
    ///
    /// Each full page moves the lower bound to the last timestamp it held and
    /// restarts at position 1, so records edited mid-pass (which jump to the
    /// end of the ordering) cannot shift an unseen record past an offset.
    /// Records at the bound are requested again; those already applied in
    /// this pass are skipped by id. Only a page made entirely of one
    /// timestamp falls back to an offset within that timestamp.
    async fn run_pass(
        &self,
        realm_id: &str,
        entity_type: EntityType,
        lock_id: Uuid,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<PassOutcome, QboError> {
        let page_size = self.source.page_size().max(1);
        let mut outcome = PassOutcome::default();
        let mut cursor = since.map(whole_seconds);
        let mut offset = 0u32;
        let mut applied_at_cursor: HashSet<String> = HashSet::new();

        loop {
            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(QboError::Cancelled),
                page = self.source.fetch_page(realm_id, entity_type, cursor, offset + 1) => page?,
            };
            outcome.pages += 1;
            let page_len = page.len();
            let mut stamped: Vec<(String, DateTime<Utc>)> = Vec::with_capacity(page_len);

            let synced_at = Utc::now();
            for record in page {
                let entity = match to_mirrored(realm_id, entity_type, record, synced_at) {
                    Ok(entity) => entity,
                    Err(e) => {
                        tracing::warn!(realm_id, %entity_type, error = %e, "skipping malformed record");
                        outcome.fetched += 1;
                        outcome.errors += 1;
                        continue;
                    }
                };

                let stamp = entity.remote_updated_at.map(whole_seconds);
                if let Some(stamp) = stamp {
                    stamped.push((entity.external_id.clone(), stamp));
                    if Some(stamp) == cursor && applied_at_cursor.contains(&entity.external_id) {
                        continue;
                    }
                }
                outcome.fetched += 1;

                match self.entities.upsert(&entity).await {
                    Ok(()) => {
                        outcome.upserted += 1;
                        if let Some(ts) = entity.remote_updated_at {
                            outcome.max_seen = Some(outcome.max_seen.map_or(ts, |m| m.max(ts)));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            realm_id,
                            %entity_type,
                            external_id = %entity.external_id,
                            error = %e,
                            "failed to upsert record"
                        );
                        outcome.errors += 1;
                    }
                }
            }

            if page_len < page_size as usize {
                break;
            }
            if let Err(e) = self.states.heartbeat(lock_id).await {
                tracing::warn!(realm_id, %entity_type, error = %e, "sync heartbeat failed");
            }

            match stamped.last().map(|(_, ts)| *ts) {
                Some(last) if cursor.map_or(true, |c| last > c) => {
                    cursor = Some(last);
                    offset = 0;
                    applied_at_cursor = stamped
                        .into_iter()
                        .filter(|(_, ts)| *ts == last)
                        .map(|(id, _)| id)
                        .collect();
                }
                _ => {
                    // The whole page sits on the bound.
                    offset += page_size;
                    applied_at_cursor.extend(
                        stamped
                            .into_iter()
                            .filter(|(_, ts)| Some(*ts) == cursor)
                            .map(|(id, _)| id),
                    );
                }
            }
        }

        Ok(outcome)
    }

    /// Sync every entity type for the realm, one after another.
    /// A failing type is recorded and the remaining types still run.
    pub async fn sync_all(&self, realm_id: &str, cancel: &CancellationToken) -> SyncAllReport {
        let mut report = SyncAllReport::default();

        for entity_type in EntityType::ALL {
            if cancel.is_cancelled() {
                report
                    .failed
                    .push((entity_type, QboError::Cancelled.to_string()));
                continue;
            }
            match self.sync_entity(realm_id, entity_type, cancel).await {
                Ok(result) => report.completed.push(result),
                Err(e) => report.failed.push((entity_type, e.to_string())),
            }
        }

        tracing::info!(
            realm_id,
            completed = report.completed.len(),
            failed = report.failed.len(),
            "realm sync finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use opsdesk_db::memory::{InMemoryEntityRepository, InMemorySyncStateRepository};
    use opsdesk_db::sync::models::SyncStatus;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    const REALM: &str = "123145";

    fn ts(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn record(id: usize, minute: i64) -> Value {
        json!({
            "Id": id.to_string(),
            "SyncToken": "0",
            "DisplayName": format!("Customer {id}"),
            "MetaData": {"LastUpdatedTime": ts(minute).to_rfc3339()}
        })
    }

    fn updated_at(record: &Value) -> DateTime<Utc> {
        record["MetaData"]["LastUpdatedTime"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// An upstream edit applied right after the given call is served.
    struct Edit {
        after_call: usize,
        entity: EntityType,
        id: usize,
        minute: i64,
    }

    /// Upstream fake ordered by `LastUpdatedTime`, like the query endpoint.
    struct FakeSource {
        page_size: u32,
        records: Mutex<HashMap<EntityType, Vec<Value>>>,
        /// Fail the n-th (1-based) request for the entity.
        fail_on_call: Option<(EntityType, usize)>,
        edit: Option<Edit>,
        requests: Mutex<Vec<(EntityType, Option<DateTime<Utc>>, u32)>>,
    }

    impl FakeSource {
        fn new(page_size: u32) -> Self {
            Self {
                page_size,
                records: Mutex::new(HashMap::new()),
                fail_on_call: None,
                edit: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn with(self, entity: EntityType, records: Vec<Value>) -> Self {
            self.records.lock().unwrap().insert(entity, records);
            self
        }

        fn failing_on_call(mut self, entity: EntityType, call: usize) -> Self {
            self.fail_on_call = Some((entity, call));
            self
        }

        fn editing(mut self, edit: Edit) -> Self {
            self.edit = Some(edit);
            self
        }

        fn requests(&self) -> Vec<(EntityType, Option<DateTime<Utc>>, u32)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EntitySource for FakeSource {
        fn page_size(&self) -> u32 {
            self.page_size
        }

        async fn fetch_page(
            &self,
            _realm_id: &str,
            entity: EntityType,
            since: Option<DateTime<Utc>>,
            start_position: u32,
        ) -> Result<Vec<Value>, QboError> {
            let call = {
                let mut requests = self.requests.lock().unwrap();
                requests.push((entity, since, start_position));
                requests.iter().filter(|r| r.0 == entity).count()
            };

            if self.fail_on_call == Some((entity, call)) {
                return Err(QboError::Upstream {
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                    body: "maintenance".to_string(),
                });
            }

            let mut records = self.records.lock().unwrap();
            let rows = records.entry(entity).or_default();
            rows.sort_by_key(updated_at);

            let page: Vec<Value> = rows
                .iter()
                .filter(|r| since.map_or(true, |since| updated_at(r) >= since))
                .skip((start_position - 1) as usize)
                .take(self.page_size as usize)
                .cloned()
                .collect();

            if let Some(edit) = &self.edit {
                if edit.entity == entity && edit.after_call == call {
                    let id = edit.id.to_string();
                    if let Some(row) = rows.iter_mut().find(|r| r["Id"] == id.as_str()) {
                        *row = record(edit.id, edit.minute);
                    }
                }
            }

            Ok(page)
        }
    }

    struct Harness {
        source: Arc<FakeSource>,
        states: Arc<InMemorySyncStateRepository>,
        entities: Arc<InMemoryEntityRepository>,
        coordinator: SyncCoordinator,
    }

    fn harness(source: FakeSource) -> Harness {
        let source = Arc::new(source);
        let states = Arc::new(InMemorySyncStateRepository::new());
        let entities = Arc::new(InMemoryEntityRepository::new());
        let coordinator = SyncCoordinator::new(source.clone(), states.clone(), entities.clone());
        Harness {
            source,
            states,
            entities,
            coordinator,
        }
    }

    #[tokio::test]
    async fn pages_until_short_page_and_advances_watermark() {
        let records = (1..=5).map(|i| record(i, i as i64)).collect();
        let h = harness(FakeSource::new(2).with(EntityType::Customer, records));

        let result = h
            .coordinator
            .sync_entity(REALM, EntityType::Customer, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.fetched, 5);
        assert_eq!(result.upserted, 5);
        assert_eq!(result.watermark, Some(ts(5)));
        assert_eq!(h.entities.len(), 5);

        // Each full page restarts from its last timestamp.
        let requests = h.source.requests();
        assert_eq!(result.pages, requests.len());
        let bounds: Vec<Option<DateTime<Utc>>> = requests.iter().map(|r| r.1).collect();
        assert_eq!(
            bounds,
            vec![None, Some(ts(2)), Some(ts(3)), Some(ts(4)), Some(ts(5))]
        );
        assert!(requests.iter().all(|r| r.2 == 1));

        let state = h.states.state(REALM, "customer").unwrap();
        assert_eq!(state.status, SyncStatus::Idle);
        assert_eq!(state.watermark, Some(ts(5)));
    }

    #[tokio::test]
    async fn record_edited_mid_pass_does_not_hide_later_records() {
        let records = (1..=4).map(|i| record(i, i as i64)).collect();
        let h = harness(
            FakeSource::new(2)
                .with(EntityType::Customer, records)
                .editing(Edit {
                    after_call: 1,
                    entity: EntityType::Customer,
                    id: 1,
                    minute: 5,
                }),
        );

        let result = h
            .coordinator
            .sync_entity(REALM, EntityType::Customer, &CancellationToken::new())
            .await
            .unwrap();

        let mut ids: Vec<String> = h
            .entities
            .snapshot()
            .into_iter()
            .map(|e| e.external_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);

        let edited = h
            .entities
            .snapshot()
            .into_iter()
            .find(|e| e.external_id == "1")
            .unwrap();
        assert_eq!(edited.remote_updated_at, Some(ts(5)));
        assert_eq!(result.watermark, Some(ts(5)));
        assert_eq!(result.errors, 0);
    }

    #[tokio::test]
    async fn page_of_identical_timestamps_advances_by_offset() {
        let records = (1..=5).map(|i| record(i, 1)).collect();
        let h = harness(FakeSource::new(2).with(EntityType::Customer, records));

        let result = h
            .coordinator
            .sync_entity(REALM, EntityType::Customer, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.entities.len(), 5);
        assert_eq!(result.fetched, 5);
        assert_eq!(result.watermark, Some(ts(1)));

        let starts: Vec<u32> = h.source.requests().iter().map(|r| r.2).collect();
        assert_eq!(starts, vec![1, 1, 3, 5]);
    }

    #[tokio::test]
    async fn second_pass_is_idempotent() {
        let records: Vec<Value> = (1..=3).map(|i| record(i, i as i64)).collect();
        let h = harness(FakeSource::new(10).with(EntityType::Customer, records));
        let cancel = CancellationToken::new();

        h.coordinator
            .sync_entity(REALM, EntityType::Customer, &cancel)
            .await
            .unwrap();
        let before = h.entities.snapshot();

        let second = h
            .coordinator
            .sync_entity(REALM, EntityType::Customer, &cancel)
            .await
            .unwrap();

        assert_eq!(h.entities.snapshot(), before);
        assert_eq!(second.watermark, Some(ts(3)));
        // Second pass asks only for records at or after the watermark.
        assert_eq!(h.source.requests()[1].1, Some(ts(3)));
    }

    #[tokio::test]
    async fn failure_mid_pass_keeps_previous_watermark() {
        let records: Vec<Value> = (1..=4).map(|i| record(i, i as i64)).collect();
        let h = harness(
            FakeSource::new(2)
                .with(EntityType::Customer, records)
                .failing_on_call(EntityType::Customer, 2),
        );

        let err = h
            .coordinator
            .sync_entity(REALM, EntityType::Customer, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QboError::Upstream { .. }));

        let state = h.states.state(REALM, "customer").unwrap();
        assert_eq!(state.status, SyncStatus::Failed);
        assert_eq!(state.watermark, None);
        assert!(state.error_message.unwrap().contains("maintenance"));

        // First page was applied; replaying it later is harmless.
        assert_eq!(h.entities.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_pass_releases_lock_without_advancing() {
        let records = vec![record(1, 1)];
        let h = harness(FakeSource::new(10).with(EntityType::Invoice, records));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .coordinator
            .sync_entity(REALM, EntityType::Invoice, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QboError::Cancelled));

        let state = h.states.state(REALM, "invoice").unwrap();
        assert_eq!(state.status, SyncStatus::Failed);
        assert_eq!(state.watermark, None);
        assert!(h.entities.is_empty());
    }

    #[tokio::test]
    async fn malformed_record_holds_watermark() {
        let records = vec![record(1, 1), json!({"DisplayName": "no id"})];
        let h = harness(FakeSource::new(10).with(EntityType::Customer, records));

        let result = h
            .coordinator
            .sync_entity(REALM, EntityType::Customer, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.upserted, 1);
        assert_eq!(result.errors, 1);
        assert_eq!(result.watermark, None);
    }

    #[tokio::test]
    async fn running_lock_skips_pass() {
        let h = harness(FakeSource::new(10));
        h.states.get_or_create(REALM, "item").await.unwrap();
        h.states.acquire_lock(REALM, "item").await.unwrap().unwrap();

        let result = h
            .coordinator
            .sync_entity(REALM, EntityType::Item, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.skipped);
        assert!(h.source.requests().is_empty());
    }

    #[tokio::test]
    async fn stale_lock_release_spares_recent_passes() {
        let h = harness(FakeSource::new(10));
        for entity in ["customer", "invoice"] {
            h.states.get_or_create(REALM, entity).await.unwrap();
            h.states.acquire_lock(REALM, entity).await.unwrap().unwrap();
        }
        let now = Utc::now();
        h.states.backdate(REALM, "customer", now - Duration::hours(2));

        let released = release_stale_locks(h.states.as_ref(), now).await.unwrap();

        assert_eq!(released, 1);
        assert_eq!(
            h.states.state(REALM, "customer").unwrap().status,
            SyncStatus::Failed
        );
        assert_eq!(
            h.states.state(REALM, "invoice").unwrap().status,
            SyncStatus::Running
        );
    }

    #[tokio::test]
    async fn heartbeat_keeps_lock_from_being_released() {
        let h = harness(FakeSource::new(10));
        h.states.get_or_create(REALM, "item").await.unwrap();
        let running = h.states.acquire_lock(REALM, "item").await.unwrap().unwrap();
        let now = Utc::now();
        h.states.backdate(REALM, "item", now - Duration::hours(2));

        h.states.heartbeat(running.id).await.unwrap();
        let released = release_stale_locks(h.states.as_ref(), now).await.unwrap();

        assert_eq!(released, 0);
        assert_eq!(
            h.states.state(REALM, "item").unwrap().status,
            SyncStatus::Running
        );
    }

    #[tokio::test]
    async fn sync_all_continues_past_failing_type() {
        let h = harness(
            FakeSource::new(10)
                .with(EntityType::Customer, vec![record(1, 1)])
                .with(EntityType::Item, vec![record(2, 2)])
                .failing_on_call(EntityType::Invoice, 1),
        );

        let report = h
            .coordinator
            .sync_all(REALM, &CancellationToken::new())
            .await;

        assert_eq!(report.completed.len(), 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, EntityType::Invoice);
        assert_eq!(h.entities.len(), 2);
    }
}

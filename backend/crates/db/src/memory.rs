//! In-memory repository implementations for tests.
//!
//! They enforce the same invariants as the Postgres repositories (one active
//! token per realm, keyed upserts, unique assignments) so service-level tests
//! can run without a database.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::calendar::models::{CalendarEvent, EventFilter, WorkAssignment};
use crate::calendar::repositories::CalendarRepository;
use crate::entities::models::{EntityFilter, EntityType, MirroredEntity};
use crate::entities::repositories::EntityRepository;
use crate::sync::models::{SyncState, SyncStatus};
use crate::sync::repositories::SyncStateRepository;
use crate::tokens::models::{NewToken, QboToken};
use crate::tokens::repositories::TokenRepository;
use crate::webhooks::models::WebhookEvent;
use crate::webhooks::repositories::WebhookEventRepository;
use opsdesk_common::error::{OpsError, OpsResult};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn page<T: Clone>(items: &[T], limit: Option<i64>, offset: Option<i64>, default: i64) -> Vec<T> {
    let offset = offset.unwrap_or(0).max(0) as usize;
    let limit = limit.unwrap_or(default).max(0) as usize;
    items.iter().skip(offset).take(limit).cloned().collect()
}

// ── Tokens ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryTokenRepository {
    rows: Mutex<Vec<QboToken>>,
}

impl InMemoryTokenRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row (active and retired) for a realm, oldest first.
    pub fn rows(&self, realm_id: &str) -> Vec<QboToken> {
        lock(&self.rows)
            .iter()
            .filter(|t| t.realm_id == realm_id)
            .cloned()
            .collect()
    }

    pub fn active_count(&self, realm_id: &str) -> usize {
        lock(&self.rows)
            .iter()
            .filter(|t| t.realm_id == realm_id && t.is_active)
            .count()
    }

    fn rotate_locked(rows: &mut Vec<QboToken>, token: NewToken) -> QboToken {
        let now = Utc::now();
        for row in rows
            .iter_mut()
            .filter(|t| t.realm_id == token.realm_id && t.is_active)
        {
            row.is_active = false;
            row.last_updated = now;
        }
        let stored = QboToken {
            id: Uuid::new_v4(),
            realm_id: token.realm_id,
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token.expires_at,
            refresh_token_expires_at: token.refresh_token_expires_at,
            is_active: true,
            created_at: now,
            last_updated: now,
        };
        rows.push(stored.clone());
        stored
    }

    /// Synchronous seeding helper.
    pub fn seed(&self, token: NewToken) -> QboToken {
        Self::rotate_locked(&mut lock(&self.rows), token)
    }
}

#[async_trait]
impl TokenRepository for InMemoryTokenRepository {
    async fn get_active(&self, realm_id: &str) -> OpsResult<Option<QboToken>> {
        Ok(lock(&self.rows)
            .iter()
            .find(|t| t.realm_id == realm_id && t.is_active)
            .cloned())
    }

    async fn rotate(&self, token: NewToken) -> OpsResult<QboToken> {
        Ok(Self::rotate_locked(&mut lock(&self.rows), token))
    }

    async fn deactivate_all(&self, realm_id: &str) -> OpsResult<u64> {
        let mut rows = lock(&self.rows);
        let mut count = 0;
        for row in rows
            .iter_mut()
            .filter(|t| t.realm_id == realm_id && t.is_active)
        {
            row.is_active = false;
            row.last_updated = Utc::now();
            count += 1;
        }
        Ok(count)
    }

    async fn list_expiring(&self, before: DateTime<Utc>) -> OpsResult<Vec<QboToken>> {
        Ok(lock(&self.rows)
            .iter()
            .filter(|t| t.is_active && t.expires_at < before)
            .cloned()
            .collect())
    }

    async fn list_active_realms(&self) -> OpsResult<Vec<String>> {
        let mut realms: Vec<String> = lock(&self.rows)
            .iter()
            .filter(|t| t.is_active)
            .map(|t| t.realm_id.clone())
            .collect();
        realms.sort();
        Ok(realms)
    }
}

// ── Sync state ──────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemorySyncStateRepository {
    rows: Mutex<HashMap<(String, String), SyncState>>,
}

impl InMemorySyncStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, realm_id: &str, entity_type: &str) -> Option<SyncState> {
        lock(&self.rows)
            .get(&(realm_id.to_string(), entity_type.to_string()))
            .cloned()
    }

    /// Rewind `updated_at`, as if the row had been untouched since `at`.
    pub fn backdate(&self, realm_id: &str, entity_type: &str, at: DateTime<Utc>) {
        if let Some(state) =
            lock(&self.rows).get_mut(&(realm_id.to_string(), entity_type.to_string()))
        {
            state.updated_at = at;
        }
    }

    fn update_by_id(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut SyncState),
    ) -> OpsResult<SyncState> {
        let mut rows = lock(&self.rows);
        let state = rows
            .values_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| OpsError::NotFound(format!("sync state not found: {id}")))?;
        apply(state);
        state.updated_at = Utc::now();
        Ok(state.clone())
    }
}

#[async_trait]
impl SyncStateRepository for InMemorySyncStateRepository {
    async fn get_or_create(&self, realm_id: &str, entity_type: &str) -> OpsResult<SyncState> {
        let mut rows = lock(&self.rows);
        let now = Utc::now();
        let state = rows
            .entry((realm_id.to_string(), entity_type.to_string()))
            .or_insert_with(|| SyncState {
                id: Uuid::new_v4(),
                realm_id: realm_id.to_string(),
                entity_type: entity_type.to_string(),
                last_synced_at: None,
                watermark: None,
                status: SyncStatus::Idle,
                error_message: None,
                created_at: now,
                updated_at: now,
            });
        Ok(state.clone())
    }

    async fn acquire_lock(
        &self,
        realm_id: &str,
        entity_type: &str,
    ) -> OpsResult<Option<SyncState>> {
        let mut rows = lock(&self.rows);
        match rows.get_mut(&(realm_id.to_string(), entity_type.to_string())) {
            Some(state) if state.status != SyncStatus::Running => {
                state.status = SyncStatus::Running;
                state.error_message = None;
                state.updated_at = Utc::now();
                Ok(Some(state.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        watermark: Option<DateTime<Utc>>,
    ) -> OpsResult<SyncState> {
        self.update_by_id(id, |state| {
            state.status = SyncStatus::Idle;
            state.last_synced_at = Some(Utc::now());
            if watermark.is_some() {
                state.watermark = watermark;
            }
            state.error_message = None;
        })
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> OpsResult<SyncState> {
        self.update_by_id(id, |state| {
            state.status = SyncStatus::Failed;
            state.error_message = Some(error_message.to_string());
        })
    }

    async fn heartbeat(&self, id: Uuid) -> OpsResult<()> {
        let mut rows = lock(&self.rows);
        if let Some(state) = rows
            .values_mut()
            .find(|s| s.id == id && s.status == SyncStatus::Running)
        {
            state.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_for_realm(&self, realm_id: &str) -> OpsResult<Vec<SyncState>> {
        let mut states: Vec<SyncState> = lock(&self.rows)
            .values()
            .filter(|s| s.realm_id == realm_id)
            .cloned()
            .collect();
        states.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));
        Ok(states)
    }

    async fn reset_stale_locks(&self, stale_before: DateTime<Utc>) -> OpsResult<u64> {
        let mut rows = lock(&self.rows);
        let mut count = 0;
        for state in rows
            .values_mut()
            .filter(|s| s.status == SyncStatus::Running && s.updated_at < stale_before)
        {
            state.status = SyncStatus::Failed;
            state.error_message = Some("interrupted before completion".to_string());
            state.updated_at = Utc::now();
            count += 1;
        }
        Ok(count)
    }
}

// ── Mirrored entities ───────────────────────────────────────────

type EntityKey = (String, EntityType, String);

#[derive(Default)]
pub struct InMemoryEntityRepository {
    rows: Mutex<HashMap<EntityKey, MirroredEntity>>,
}

impl InMemoryEntityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All rows sorted by key, for whole-state comparisons.
    pub fn snapshot(&self) -> Vec<MirroredEntity> {
        let rows = lock(&self.rows);
        let mut keys: Vec<&EntityKey> = rows.keys().collect();
        keys.sort();
        keys.into_iter().filter_map(|k| rows.get(k).cloned()).collect()
    }
}

#[async_trait]
impl EntityRepository for InMemoryEntityRepository {
    async fn upsert(&self, entity: &MirroredEntity) -> OpsResult<()> {
        let mut rows = lock(&self.rows);
        let key = (
            entity.realm_id.clone(),
            entity.entity_type,
            entity.external_id.clone(),
        );
        match rows.get_mut(&key) {
            Some(existing)
                if existing.payload == entity.payload
                    && existing.sync_token == entity.sync_token => {}
            Some(existing) => {
                let id = existing.id;
                *existing = MirroredEntity {
                    id,
                    ..entity.clone()
                };
            }
            None => {
                rows.insert(key, entity.clone());
            }
        }
        Ok(())
    }

    async fn get(
        &self,
        realm_id: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> OpsResult<Option<MirroredEntity>> {
        Ok(lock(&self.rows)
            .get(&(realm_id.to_string(), entity_type, external_id.to_string()))
            .cloned())
    }

    async fn list(
        &self,
        realm_id: &str,
        entity_type: EntityType,
        filter: EntityFilter,
    ) -> OpsResult<(Vec<MirroredEntity>, i64)> {
        let needle = filter.search.as_deref().map(|s| s.trim().to_lowercase());
        let mut matching: Vec<MirroredEntity> = lock(&self.rows)
            .values()
            .filter(|e| e.realm_id == realm_id && e.entity_type == entity_type)
            .filter(|e| match (&needle, &e.display_name) {
                (Some(n), Some(name)) => name.to_lowercase().contains(n.as_str()),
                (Some(n), None) => n.is_empty(),
                (None, _) => true,
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            (a.display_name.is_none(), &a.display_name, &a.external_id).cmp(&(
                b.display_name.is_none(),
                &b.display_name,
                &b.external_id,
            ))
        });
        let total = matching.len() as i64;
        Ok((page(&matching, filter.limit, filter.offset, 50), total))
    }
}

// ── Calendar ────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryCalendarRepository {
    events: Mutex<HashMap<Uuid, CalendarEvent>>,
    assignments: Mutex<Vec<WorkAssignment>>,
}

impl InMemoryCalendarRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CalendarRepository for InMemoryCalendarRepository {
    async fn list_events(&self, filter: EventFilter) -> OpsResult<(Vec<CalendarEvent>, i64)> {
        let mut events: Vec<CalendarEvent> = lock(&self.events)
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        events.sort_by(|a, b| (a.start_at, a.id).cmp(&(b.start_at, b.id)));
        let total = events.len() as i64;
        Ok((page(&events, filter.limit, filter.offset, 100), total))
    }

    async fn get_event(&self, id: Uuid) -> OpsResult<Option<CalendarEvent>> {
        Ok(lock(&self.events).get(&id).cloned())
    }

    async fn create_event(&self, event: CalendarEvent) -> OpsResult<CalendarEvent> {
        let mut events = lock(&self.events);
        if events.contains_key(&event.id) {
            return Err(OpsError::Conflict("calendar event already exists".to_string()));
        }
        events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn update_event(&self, event: CalendarEvent) -> OpsResult<CalendarEvent> {
        let mut events = lock(&self.events);
        let existing = events
            .get_mut(&event.id)
            .ok_or_else(|| OpsError::NotFound(format!("calendar event not found: {}", event.id)))?;
        *existing = CalendarEvent {
            created_at: existing.created_at,
            created_by: existing.created_by,
            ..event
        };
        Ok(existing.clone())
    }

    async fn delete_event(&self, id: Uuid) -> OpsResult<()> {
        if lock(&self.events).remove(&id).is_none() {
            return Err(OpsError::NotFound(format!("calendar event not found: {id}")));
        }
        lock(&self.assignments).retain(|a| a.event_id != id);
        Ok(())
    }

    async fn list_assignments(&self, event_id: Uuid) -> OpsResult<Vec<WorkAssignment>> {
        let mut listed: Vec<WorkAssignment> = lock(&self.assignments)
            .iter()
            .filter(|a| a.event_id == event_id)
            .cloned()
            .collect();
        listed.sort_by(|a, b| {
            (a.sequence_order, a.created_at, a.id).cmp(&(b.sequence_order, b.created_at, b.id))
        });
        Ok(listed)
    }

    async fn list_assignments_for_employee(
        &self,
        employee_id: Uuid,
    ) -> OpsResult<Vec<WorkAssignment>> {
        let events = lock(&self.events);
        let mut listed: Vec<WorkAssignment> = lock(&self.assignments)
            .iter()
            .filter(|a| a.employee_id == employee_id)
            .cloned()
            .collect();
        listed.sort_by_key(|a| (events.get(&a.event_id).map(|e| e.start_at), a.sequence_order));
        Ok(listed)
    }

    async fn get_assignment(&self, id: Uuid) -> OpsResult<Option<WorkAssignment>> {
        Ok(lock(&self.assignments).iter().find(|a| a.id == id).cloned())
    }

    async fn create_assignment(&self, assignment: WorkAssignment) -> OpsResult<WorkAssignment> {
        if !lock(&self.events).contains_key(&assignment.event_id) {
            return Err(OpsError::NotFound(format!(
                "calendar event not found: {}",
                assignment.event_id
            )));
        }
        let mut assignments = lock(&self.assignments);
        if assignments
            .iter()
            .any(|a| a.event_id == assignment.event_id && a.employee_id == assignment.employee_id)
        {
            return Err(OpsError::Conflict(
                "employee is already assigned to this event".to_string(),
            ));
        }
        assignments.push(assignment.clone());
        Ok(assignment)
    }

    async fn update_assignment(&self, assignment: WorkAssignment) -> OpsResult<WorkAssignment> {
        let mut assignments = lock(&self.assignments);
        let existing = assignments
            .iter_mut()
            .find(|a| a.id == assignment.id)
            .ok_or_else(|| {
                OpsError::NotFound(format!("work assignment not found: {}", assignment.id))
            })?;
        existing.role = assignment.role;
        existing.status = assignment.status;
        existing.sequence_order = assignment.sequence_order;
        existing.notes = assignment.notes;
        existing.updated_at = assignment.updated_at;
        Ok(existing.clone())
    }

    async fn delete_assignment(&self, id: Uuid) -> OpsResult<()> {
        let mut assignments = lock(&self.assignments);
        let before = assignments.len();
        assignments.retain(|a| a.id != id);
        if assignments.len() == before {
            return Err(OpsError::NotFound(format!("work assignment not found: {id}")));
        }
        Ok(())
    }
}

// ── Webhook log ─────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryWebhookEventRepository {
    keys: Mutex<HashSet<(String, String)>>,
    events: Mutex<Vec<WebhookEvent>>,
}

impl InMemoryWebhookEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<WebhookEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl WebhookEventRepository for InMemoryWebhookEventRepository {
    async fn record(&self, event: &WebhookEvent) -> OpsResult<bool> {
        let inserted = lock(&self.keys).insert((event.provider.clone(), event.dedup_key.clone()));
        if inserted {
            lock(&self.events).push(event.clone());
        }
        Ok(inserted)
    }
}

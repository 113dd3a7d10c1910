use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, QueryBuilder, Row};
use uuid::Uuid;

use crate::calendar::models::{AssignmentStatus, CalendarEvent, EventFilter, WorkAssignment};
use crate::calendar::repositories::CalendarRepository;
use crate::map_write_error;
use opsdesk_common::error::{OpsError, OpsResult};

const EVENT_COLUMNS: &str = "id, title, description, location, start_at, end_at, all_day, \
     created_by, created_at, updated_at";
const ASSIGNMENT_COLUMNS: &str = "id, event_id, employee_id, role, status, sequence_order, \
     notes, created_at, updated_at";

#[derive(Clone)]
pub struct PgCalendarRepository {
    pool: PgPool,
}

impl PgCalendarRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_event_row(row: PgRow) -> CalendarEvent {
        CalendarEvent {
            id: row.get("id"),
            title: row.get("title"),
            description: row.get("description"),
            location: row.get("location"),
            start_at: row.get("start_at"),
            end_at: row.get("end_at"),
            all_day: row.get("all_day"),
            created_by: row.get("created_by"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    fn map_assignment_row(row: PgRow) -> OpsResult<WorkAssignment> {
        let status_raw: String = row.get("status");
        let status = AssignmentStatus::from_str(&status_raw).map_err(OpsError::Internal)?;

        Ok(WorkAssignment {
            id: row.get("id"),
            event_id: row.get("event_id"),
            employee_id: row.get("employee_id"),
            role: row.get("role"),
            status,
            sequence_order: row.get("sequence_order"),
            notes: row.get("notes"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn push_window<'a>(qb: &mut QueryBuilder<'a, sqlx::Postgres>, filter: &EventFilter) {
        qb.push(" where true");
        if let Some(from) = filter.from {
            qb.push(" and end_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            qb.push(" and start_at < ").push_bind(to);
        }
    }
}

#[async_trait]
impl CalendarRepository for PgCalendarRepository {
    async fn list_events(&self, filter: EventFilter) -> OpsResult<(Vec<CalendarEvent>, i64)> {
        let mut count_qb = QueryBuilder::new("select count(*) from calendar_events");
        Self::push_window(&mut count_qb, &filter);
        let total = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| OpsError::Database(e.to_string()))?;

        let mut qb = QueryBuilder::new(format!("select {EVENT_COLUMNS} from calendar_events"));
        Self::push_window(&mut qb, &filter);
        qb.push(" order by start_at, id");
        qb.push(" limit ").push_bind(filter.limit.unwrap_or(100));
        qb.push(" offset ").push_bind(filter.offset.unwrap_or(0));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OpsError::Database(e.to_string()))?;

        Ok((rows.into_iter().map(Self::map_event_row).collect(), total))
    }

    async fn get_event(&self, id: Uuid) -> OpsResult<Option<CalendarEvent>> {
        let row = sqlx::query(&format!(
            "select {EVENT_COLUMNS} from calendar_events where id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        Ok(row.map(Self::map_event_row))
    }

    async fn create_event(&self, event: CalendarEvent) -> OpsResult<CalendarEvent> {
        let row = sqlx::query(&format!(
            "insert into calendar_events
             (id, title, description, location, start_at, end_at, all_day, created_by, created_at, updated_at)
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             returning {EVENT_COLUMNS}"
        ))
        .bind(event.id)
        .bind(&event.title)
        .bind(&event.description)
        .bind(&event.location)
        .bind(event.start_at)
        .bind(event.end_at)
        .bind(event.all_day)
        .bind(event.created_by)
        .bind(event.created_at)
        .bind(event.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_write_error(e, "calendar event already exists"))?;

        Ok(Self::map_event_row(row))
    }

    async fn update_event(&self, event: CalendarEvent) -> OpsResult<CalendarEvent> {
        let row = sqlx::query(&format!(
            "update calendar_events
             set title = $1, description = $2, location = $3, start_at = $4, end_at = $5,
                 all_day = $6, updated_at = $7
             where id = $8
             returning {EVENT_COLUMNS}"
        ))
        .bind(&event.title)
        .bind(&event.description)
        .bind(&event.location)
        .bind(event.start_at)
        .bind(event.end_at)
        .bind(event.all_day)
        .bind(event.updated_at)
        .bind(event.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        row.map(Self::map_event_row)
            .ok_or_else(|| OpsError::NotFound(format!("calendar event not found: {}", event.id)))
    }

    async fn delete_event(&self, id: Uuid) -> OpsResult<()> {
        let result = sqlx::query("delete from calendar_events where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| OpsError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(OpsError::NotFound(format!("calendar event not found: {id}")));
        }
        Ok(())
    }

    async fn list_assignments(&self, event_id: Uuid) -> OpsResult<Vec<WorkAssignment>> {
        let rows = sqlx::query(&format!(
            "select {ASSIGNMENT_COLUMNS} from work_assignments
             where event_id = $1
             order by sequence_order, created_at, id"
        ))
        .bind(event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        rows.into_iter().map(Self::map_assignment_row).collect()
    }

    async fn list_assignments_for_employee(
        &self,
        employee_id: Uuid,
    ) -> OpsResult<Vec<WorkAssignment>> {
        let rows = sqlx::query(
            "select a.id, a.event_id, a.employee_id, a.role, a.status, a.sequence_order,
                    a.notes, a.created_at, a.updated_at
             from work_assignments a
             join calendar_events e on e.id = a.event_id
             where a.employee_id = $1
             order by e.start_at, a.sequence_order",
        )
        .bind(employee_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        rows.into_iter().map(Self::map_assignment_row).collect()
    }

    async fn get_assignment(&self, id: Uuid) -> OpsResult<Option<WorkAssignment>> {
        let row = sqlx::query(&format!(
            "select {ASSIGNMENT_COLUMNS} from work_assignments where id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        row.map(Self::map_assignment_row).transpose()
    }

    async fn create_assignment(&self, assignment: WorkAssignment) -> OpsResult<WorkAssignment> {
        let row = sqlx::query(&format!(
            "insert into work_assignments
             (id, event_id, employee_id, role, status, sequence_order, notes, created_at, updated_at)
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             returning {ASSIGNMENT_COLUMNS}"
        ))
        .bind(assignment.id)
        .bind(assignment.event_id)
        .bind(assignment.employee_id)
        .bind(&assignment.role)
        .bind(assignment.status.as_str())
        .bind(assignment.sequence_order)
        .bind(&assignment.notes)
        .bind(assignment.created_at)
        .bind(assignment.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_write_error(e, "employee is already assigned to this event"))?;

        Self::map_assignment_row(row)
    }

    async fn update_assignment(&self, assignment: WorkAssignment) -> OpsResult<WorkAssignment> {
        let row = sqlx::query(&format!(
            "update work_assignments
             set role = $1, status = $2, sequence_order = $3, notes = $4, updated_at = $5
             where id = $6
             returning {ASSIGNMENT_COLUMNS}"
        ))
        .bind(&assignment.role)
        .bind(assignment.status.as_str())
        .bind(assignment.sequence_order)
        .bind(&assignment.notes)
        .bind(assignment.updated_at)
        .bind(assignment.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OpsError::Database(e.to_string()))?;

        match row {
            Some(r) => Self::map_assignment_row(r),
            None => Err(OpsError::NotFound(format!(
                "work assignment not found: {}",
                assignment.id
            ))),
        }
    }

    async fn delete_assignment(&self, id: Uuid) -> OpsResult<()> {
        let result = sqlx::query("delete from work_assignments where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| OpsError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(OpsError::NotFound(format!("work assignment not found: {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_pool;
    use chrono::{Duration, Utc};

    fn event() -> CalendarEvent {
        let now = Utc::now();
        CalendarEvent {
            id: Uuid::new_v4(),
            title: "Kitchen install".to_string(),
            description: None,
            location: Some("12 Main St".to_string()),
            start_at: now,
            end_at: now + Duration::hours(4),
            all_day: false,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn assignment(event_id: Uuid, sequence_order: i32) -> WorkAssignment {
        let now = Utc::now();
        WorkAssignment {
            id: Uuid::new_v4(),
            event_id,
            employee_id: Uuid::new_v4(),
            role: None,
            status: AssignmentStatus::Scheduled,
            sequence_order,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn assignments_listed_by_sequence_order() {
        let pool = match test_pool().await {
            Some(p) => p,
            None => return,
        };
        let repo = PgCalendarRepository::new(pool);
        let ev = repo.create_event(event()).await.expect("create event");

        // Insert out of order on purpose.
        let second = repo.create_assignment(assignment(ev.id, 2)).await.expect("second");
        let first = repo.create_assignment(assignment(ev.id, 1)).await.expect("first");

        let listed = repo.list_assignments(ev.id).await.expect("list");
        let ids: Vec<Uuid> = listed.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn duplicate_employee_on_event_is_conflict() {
        let pool = match test_pool().await {
            Some(p) => p,
            None => return,
        };
        let repo = PgCalendarRepository::new(pool);
        let ev = repo.create_event(event()).await.expect("create event");

        let a = assignment(ev.id, 1);
        let mut dup = assignment(ev.id, 2);
        dup.employee_id = a.employee_id;

        repo.create_assignment(a).await.expect("first");
        let err = repo.create_assignment(dup).await.unwrap_err();
        assert!(matches!(err, OpsError::Conflict(_)));
    }

    #[tokio::test]
    async fn assignment_for_missing_event_is_not_found() {
        let pool = match test_pool().await {
            Some(p) => p,
            None => return,
        };
        let repo = PgCalendarRepository::new(pool);
        let err = repo
            .create_assignment(assignment(Uuid::new_v4(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_event_cascades_to_assignments() {
        let pool = match test_pool().await {
            Some(p) => p,
            None => return,
        };
        let repo = PgCalendarRepository::new(pool);
        let ev = repo.create_event(event()).await.expect("create event");
        let a = repo.create_assignment(assignment(ev.id, 1)).await.expect("assign");

        repo.delete_event(ev.id).await.expect("delete");
        assert!(repo.get_assignment(a.id).await.expect("get").is_none());
        assert!(matches!(
            repo.delete_event(ev.id).await,
            Err(OpsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_missing_event_is_not_found() {
        let pool = match test_pool().await {
            Some(p) => p,
            None => return,
        };
        let repo = PgCalendarRepository::new(pool);
        let err = repo.update_event(event()).await.unwrap_err();
        assert!(matches!(err, OpsError::NotFound(_)));
    }
}
